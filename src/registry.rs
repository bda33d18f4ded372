/*!
 * Audio device enumeration and resolution.
 *
 * The registry is an explicit instance with bounded lifetime, held by the
 * session manager and the gRPC service rather than accessed statically.
 */

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::AudioBackend;
use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    Capture,
    Playback,
}

/// Immutable snapshot of one host device, taken at enumeration time.
///
/// Becomes stale if the host device set changes; staleness is not detected
/// here, callers re-enumerate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
}

impl AudioDevice {
    pub fn can_capture(&self) -> bool {
        self.capabilities.contains(&Capability::Capture)
    }
}

pub struct AudioDeviceRegistry {
    backend: Arc<dyn AudioBackend>,
    /// Devices from the most recent enumeration, keyed by id. Resolution
    /// works against identity because identity, not a handle, is what
    /// crosses the wire.
    last_enumeration: Mutex<HashMap<String, AudioDevice>>,
}

impl AudioDeviceRegistry {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            backend,
            last_enumeration: Mutex::new(HashMap::new()),
        }
    }

    /// Re-enumerates host devices. Never fails; a host with no audio devices
    /// yields an empty set.
    pub fn list_devices(&self) -> Vec<AudioDevice> {
        let mut devices: Vec<AudioDevice> = self
            .backend
            .enumerate()
            .into_iter()
            .map(|d| {
                let mut capabilities = BTreeSet::new();
                if d.has_input {
                    capabilities.insert(Capability::Capture);
                }
                if d.has_output {
                    capabilities.insert(Capability::Playback);
                }
                AudioDevice {
                    id: d.id,
                    name: d.name,
                    capabilities,
                }
            })
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));

        let mut cache = self.last_enumeration.lock().unwrap();
        cache.clear();
        for device in &devices {
            cache.insert(device.id.clone(), device.clone());
        }
        debug!("Enumerated {} audio devices", devices.len());

        devices
    }

    /// Resolves a selector (device id or name) against the most recent
    /// enumeration only.
    pub fn resolve(&self, selector: &str) -> Result<AudioDevice> {
        let cache = self.last_enumeration.lock().unwrap();
        if let Some(device) = cache.get(selector) {
            return Ok(device.clone());
        }
        // Duplicate names resolve to the lowest id so the answer is stable
        // across calls.
        cache
            .values()
            .filter(|d| d.name == selector)
            .min_by(|a, b| a.id.cmp(&b.id))
            .cloned()
            .ok_or_else(|| HarnessError::UnknownDevice(selector.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MIXER_ONE, MIXER_TWO};
    use crate::backend::BackendDevice;

    #[test]
    fn test_list_devices_reports_capabilities() {
        let registry = AudioDeviceRegistry::new(Arc::new(MockBackend::with_fixture_devices()));

        let devices = registry.list_devices();
        assert_eq!(devices.len(), 2);

        let one = devices.iter().find(|d| d.name == MIXER_ONE).unwrap();
        assert_eq!(
            one.capabilities,
            BTreeSet::from([Capability::Capture]),
            "input-capable mixer reports exactly the capture capability"
        );

        let two = devices.iter().find(|d| d.name == MIXER_TWO).unwrap();
        assert!(two.capabilities.is_empty());
    }

    #[test]
    fn test_empty_host_yields_empty_set() {
        let registry = AudioDeviceRegistry::new(Arc::new(MockBackend::new(vec![])));
        assert!(registry.list_devices().is_empty());
    }

    #[test]
    fn test_resolve_by_id_and_name() {
        let registry = AudioDeviceRegistry::new(Arc::new(MockBackend::with_fixture_devices()));
        registry.list_devices();

        assert_eq!(registry.resolve(MIXER_ONE).unwrap().name, MIXER_ONE);
        assert!(matches!(
            registry.resolve("Mixer Nine"),
            Err(HarnessError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_duplicate_names_keep_distinct_ids_and_resolve_stably() {
        let duplicate = |id: &str| BackendDevice {
            id: id.to_string(),
            name: "USB Mic".to_string(),
            has_input: true,
            has_output: false,
        };
        let registry = AudioDeviceRegistry::new(Arc::new(MockBackend::new(vec![
            duplicate("USB Mic"),
            duplicate("USB Mic#1"),
        ])));
        registry.list_devices();

        // Ids address each physical device; the bare name always resolves to
        // the same one.
        assert_eq!(registry.resolve("USB Mic#1").unwrap().id, "USB Mic#1");
        assert_eq!(registry.resolve("USB Mic").unwrap().id, "USB Mic");
    }

    #[test]
    fn test_resolve_tracks_most_recent_enumeration() {
        let backend = Arc::new(MockBackend::with_fixture_devices());
        let registry = AudioDeviceRegistry::new(backend.clone());
        registry.list_devices();
        assert!(registry.resolve(MIXER_TWO).is_ok());

        // Device unplugged between enumerations
        backend.set_devices(vec![BackendDevice {
            id: MIXER_ONE.to_string(),
            name: MIXER_ONE.to_string(),
            has_input: true,
            has_output: true,
        }]);
        registry.list_devices();

        assert!(matches!(
            registry.resolve(MIXER_TWO),
            Err(HarnessError::UnknownDevice(_))
        ));
    }
}
