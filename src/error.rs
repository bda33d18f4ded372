/*!
 * Error taxonomy for the audio harness.
 *
 * Every failure is scoped to a single request, session, or sink; none of
 * these terminate the server process.
 */

use thiserror::Error;
use tonic::Status;

use crate::format::AudioFormat;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Selector did not match any device in the most recent enumeration.
    /// Not retried; the client must re-enumerate.
    #[error("unknown audio device: {0}")]
    UnknownDevice(String),

    /// An open session already holds the device at an incompatible format.
    /// The hardware line cannot be reconfigured while open.
    #[error("format conflict on device {device}: session is open at {open}, requested {requested}")]
    FormatConflict {
        device: String,
        open: AudioFormat,
        requested: AudioFormat,
    },

    /// The hardware line is busy or rejected the format at the OS level.
    /// Surfaced immediately; a competing process may hold the line forever.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Operation against a capturer or session that has already closed.
    #[error("capture session is closed")]
    SessionClosed,

    /// A single sink failed or stalled; only that sink is detached.
    #[error("sink write failed: {0}")]
    SinkWrite(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Maps each taxonomy entry to a distinct wire-level failure code so clients
/// can tell "device doesn't exist" from "device busy with incompatible
/// format" from "hardware line rejected".
impl From<HarnessError> for Status {
    fn from(err: HarnessError) -> Self {
        match &err {
            HarnessError::UnknownDevice(_) => Status::not_found(err.to_string()),
            HarnessError::FormatConflict { .. } => Status::failed_precondition(err.to_string()),
            HarnessError::DeviceUnavailable(_) => Status::unavailable(err.to_string()),
            HarnessError::SessionClosed => Status::failed_precondition(err.to_string()),
            HarnessError::SinkWrite(_) | HarnessError::Io(_) => Status::internal(err.to_string()),
        }
    }
}
