/*!
 * Capture session lifecycle.
 *
 * The manager owns every session, enforces device exclusivity (at most one
 * open session per physical device), and serializes open/close per device
 * without serializing unrelated devices against each other.
 */

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::backend::AudioBackend;
use crate::capture::{AudioCapturer, CaptureOptions, SinkId};
use crate::chunk::CaptureChunk;
use crate::error::{HarnessError, Result};
use crate::format::AudioFormat;
use crate::registry::AudioDevice;
use crate::sink::FileSink;

/// One device's open hardware line plus its consumers.
pub struct CaptureSession {
    id: Uuid,
    capturer: AudioCapturer,
}

impl CaptureSession {
    fn new(
        device: AudioDevice,
        format: AudioFormat,
        backend: Arc<dyn AudioBackend>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            capturer: AudioCapturer::new(device, format, backend, options),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device(&self) -> &AudioDevice {
        self.capturer.device()
    }

    pub fn format(&self) -> AudioFormat {
        self.capturer.format()
    }

    pub fn is_open(&self) -> bool {
        self.capturer.is_open()
    }

    pub fn sink_count(&self) -> usize {
        self.capturer.sink_count()
    }

    /// Attaches a transient (stream) sink. The channel closes on any detach
    /// path, so the receiver always observes end-of-stream.
    pub fn attach_stream(&self, label: &str) -> Result<(SinkId, mpsc::Receiver<CaptureChunk>)> {
        self.capturer.attach(label)
    }

    /// Attaches a durable file sink appending raw PCM at this session's
    /// format.
    pub fn attach_file(&self, path: &Path) -> Result<SinkId> {
        let (id, rx) = self.capturer.attach(&format!("file:{}", path.display()))?;
        FileSink::spawn(path, rx)?;
        Ok(id)
    }

    pub fn detach(&self, sink_id: SinkId) -> bool {
        self.capturer.detach(sink_id)
    }

    fn open(&self) -> Result<()> {
        self.capturer.open()
    }

    fn close(&self) {
        self.capturer.close()
    }

    fn detach_all(&self) -> usize {
        self.capturer.detach_all()
    }
}

type DeviceSlot = Arc<tokio::sync::Mutex<Option<Arc<CaptureSession>>>>;

pub struct CaptureSessionManager {
    backend: Arc<dyn AudioBackend>,
    options: CaptureOptions,
    /// Per-device creation/close lock; the map mutex is held only to fetch a
    /// slot, so unrelated devices never contend.
    slots: Mutex<HashMap<String, DeviceSlot>>,
    sessions: Mutex<HashMap<Uuid, (String, Arc<CaptureSession>)>>,
}

impl CaptureSessionManager {
    pub fn new(backend: Arc<dyn AudioBackend>, options: CaptureOptions) -> Self {
        Self {
            backend,
            options,
            slots: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, device_id: &str) -> DeviceSlot {
        self.slots
            .lock()
            .unwrap()
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    /// Returns the open session for `device`, or creates and opens one.
    ///
    /// Atomic per device: under concurrent calls exactly one `open()` runs
    /// and the losers receive the winner's session. An open session with a
    /// different format is a `FormatConflict`; the hardware line cannot be
    /// reconfigured while open.
    pub async fn get_or_create(
        &self,
        device: &AudioDevice,
        format: AudioFormat,
    ) -> Result<Arc<CaptureSession>> {
        let slot = self.slot(&device.id);
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref() {
            if session.is_open() {
                if session.format() == format {
                    debug!("Joining open session {} on {}", session.id(), device.name);
                    return Ok(session.clone());
                }
                return Err(HarnessError::FormatConflict {
                    device: device.name.clone(),
                    open: session.format(),
                    requested: format,
                });
            }
            // Stale closed session; forget it before building a new one.
            self.sessions.lock().unwrap().remove(&session.id());
            *guard = None;
        }

        let session = Arc::new(CaptureSession::new(
            device.clone(),
            format,
            self.backend.clone(),
            self.options.clone(),
        ));
        let opening = session.clone();
        tokio::task::spawn_blocking(move || opening.open())
            .await
            .map_err(|e| {
                HarnessError::DeviceUnavailable(format!("capture open task failed: {}", e))
            })??;

        *guard = Some(session.clone());
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id(), (device.id.clone(), session.clone()));
        info!(
            "Opened capture session {} on {} at {}",
            session.id(),
            device.name,
            format
        );

        Ok(session)
    }

    /// Closes the named session if it has no remaining sinks. Returns false
    /// (without closing) when sinks are still attached.
    pub async fn close_session(&self, session_id: Uuid) -> Result<bool> {
        let (device_id, session) = self.lookup(session_id)?;
        let slot = self.slot(&device_id);
        let mut guard = slot.lock().await;

        if session.sink_count() > 0 {
            return Ok(false);
        }

        let closing = session.clone();
        let _ = tokio::task::spawn_blocking(move || closing.close()).await;
        *guard = None;
        self.sessions.lock().unwrap().remove(&session_id);
        info!("Closed capture session {}", session_id);

        Ok(true)
    }

    /// Closes the named session unconditionally, detaching all sinks first.
    pub async fn force_close_session(&self, session_id: Uuid) -> Result<()> {
        let (device_id, session) = self.lookup(session_id)?;
        let slot = self.slot(&device_id);
        let mut guard = slot.lock().await;

        let detached = session.detach_all();
        let closing = session.clone();
        let _ = tokio::task::spawn_blocking(move || closing.close()).await;
        *guard = None;
        self.sessions.lock().unwrap().remove(&session_id);
        info!(
            "Force-closed capture session {} ({} sinks detached)",
            session_id, detached
        );

        Ok(())
    }

    /// Detaches one stream sink and reaps the session if that was the last
    /// consumer. Used when a streaming client cancels or disconnects.
    pub async fn release_stream_sink(&self, session_id: Uuid, sink_id: SinkId) {
        let Ok((_, session)) = self.lookup(session_id) else {
            return;
        };
        session.detach(sink_id);
        if session.sink_count() == 0 {
            if let Ok(true) = self.close_session(session_id).await {
                debug!("Session {} reaped after last sink detached", session_id);
            }
        }
    }

    /// Closes every session, each independently; one failure does not stop
    /// the others.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Arc<CaptureSession>)> =
            self.sessions.lock().unwrap().values().cloned().collect();
        for (device_id, session) in sessions {
            let closing = session.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || closing.close()).await {
                error!("Failed to close session on {}: {}", device_id, e);
            }
        }
        self.sessions.lock().unwrap().clear();
        self.slots.lock().unwrap().clear();
        info!("Session manager shut down");
    }

    fn lookup(&self, session_id: Uuid) -> Result<(String, Arc<CaptureSession>)> {
        self.sessions
            .lock()
            .unwrap()
            .get(&session_id)
            .cloned()
            .ok_or(HarnessError::SessionClosed)
    }
}
