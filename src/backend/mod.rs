/*!
 * Host audio backends.
 *
 * A backend enumerates the host's audio devices and opens input lines on
 * them. Backends are selected at construction, one implementation per host
 * audio stack.
 */

pub mod cpal_backend;

#[cfg(test)]
pub mod mock;

use crate::error::Result;
use crate::format::AudioFormat;

/// Device as reported by a backend enumeration pass.
#[derive(Debug, Clone)]
pub struct BackendDevice {
    /// Stable identity within one enumeration; doubles as the open handle.
    pub id: String,
    pub name: String,
    pub has_input: bool,
    pub has_output: bool,
}

/// An open hardware input line.
///
/// `read` blocks for at most roughly one frame period and returns the number
/// of bytes written into `buf`; 0 means nothing was available yet. Dropping
/// or closing the line releases the hardware.
pub trait CaptureLine: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn close(&mut self);
}

/// Host audio capability surface.
pub trait AudioBackend: Send + Sync {
    /// Enumerates devices as the host currently sees them. An empty vec is a
    /// valid answer, not an error.
    fn enumerate(&self) -> Vec<BackendDevice>;

    /// Acquires the named device's input line at the given format.
    ///
    /// Fails with `DeviceUnavailable` when the line is exclusively held or
    /// the device rejects the format.
    fn open_input(&self, device_id: &str, format: AudioFormat) -> Result<Box<dyn CaptureLine>>;
}
