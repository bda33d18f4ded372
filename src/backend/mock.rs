//! Deterministic in-memory backend for tests.
//!
//! Two fixture devices mirror a host with one capture-capable mixer and one
//! mixer without an input line. Lines generate a rolling byte pattern at a
//! configurable pace and enforce one open line per device.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{AudioBackend, BackendDevice, CaptureLine};
use crate::error::{HarnessError, Result};
use crate::format::AudioFormat;

pub const MIXER_ONE: &str = "Mixer One";
pub const MIXER_TWO: &str = "Mixer Two";

pub struct MockBackend {
    devices: Mutex<Vec<BackendDevice>>,
    open_counts: Mutex<HashMap<String, usize>>,
    open_lines: Arc<Mutex<HashSet<String>>>,
    pace: Duration,
}

impl MockBackend {
    pub fn new(devices: Vec<BackendDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            open_counts: Mutex::new(HashMap::new()),
            open_lines: Arc::new(Mutex::new(HashSet::new())),
            pace: Duration::from_millis(2),
        }
    }

    /// Host with "Mixer One" (input line) and "Mixer Two" (no input line).
    pub fn with_fixture_devices() -> Self {
        Self::new(vec![
            BackendDevice {
                id: MIXER_ONE.to_string(),
                name: MIXER_ONE.to_string(),
                has_input: true,
                has_output: false,
            },
            BackendDevice {
                id: MIXER_TWO.to_string(),
                name: MIXER_TWO.to_string(),
                has_input: false,
                has_output: false,
            },
        ])
    }

    /// Replace the host's device set, simulating hotplug between enumerations.
    pub fn set_devices(&self, devices: Vec<BackendDevice>) {
        *self.devices.lock().unwrap() = devices;
    }

    /// Number of times `open_input` succeeded for a device.
    pub fn open_count(&self, device_id: &str) -> usize {
        self.open_counts
            .lock()
            .unwrap()
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    /// Whether a hardware line is currently held open on the device.
    pub fn line_open(&self, device_id: &str) -> bool {
        self.open_lines.lock().unwrap().contains(device_id)
    }
}

impl AudioBackend for MockBackend {
    fn enumerate(&self) -> Vec<BackendDevice> {
        self.devices.lock().unwrap().clone()
    }

    fn open_input(&self, device_id: &str, _format: AudioFormat) -> Result<Box<dyn CaptureLine>> {
        let device = self
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.id == device_id)
            .cloned()
            .ok_or_else(|| {
                HarnessError::DeviceUnavailable(format!("device {} not present", device_id))
            })?;
        if !device.has_input {
            return Err(HarnessError::DeviceUnavailable(format!(
                "device {} has no input line",
                device_id
            )));
        }

        {
            let mut open = self.open_lines.lock().unwrap();
            if !open.insert(device_id.to_string()) {
                return Err(HarnessError::DeviceUnavailable(format!(
                    "line on {} is exclusively held",
                    device_id
                )));
            }
        }
        *self
            .open_counts
            .lock()
            .unwrap()
            .entry(device_id.to_string())
            .or_insert(0) += 1;

        Ok(Box::new(MockLine {
            device_id: device_id.to_string(),
            open_lines: self.open_lines.clone(),
            counter: 0,
            pace: self.pace,
            closed: false,
        }))
    }
}

struct MockLine {
    device_id: String,
    open_lines: Arc<Mutex<HashSet<String>>>,
    counter: u8,
    pace: Duration,
    closed: bool,
}

impl CaptureLine for MockLine {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Ok(0);
        }
        std::thread::sleep(self.pace);
        for byte in buf.iter_mut() {
            *byte = self.counter;
            self.counter = self.counter.wrapping_add(1);
        }
        Ok(buf.len())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_lines.lock().unwrap().remove(&self.device_id);
        }
    }
}

impl Drop for MockLine {
    fn drop(&mut self) {
        self.close();
    }
}
