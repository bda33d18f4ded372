/*!
 * Audio capturer: one hardware line, one capture loop, many sinks.
 *
 * The capture loop is the only producer of chunks. Sinks are bounded
 * channels; delivery never blocks the loop, and a sink that stalls past the
 * write timeout is detached without disturbing the session or other sinks.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::backend::{AudioBackend, CaptureLine};
use crate::chunk::CaptureChunk;
use crate::error::{HarnessError, Result};
use crate::format::AudioFormat;
use crate::registry::AudioDevice;

pub type SinkId = u64;

/// Capture tuning knobs.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Target chunk payload size.
    pub chunk_bytes: usize,
    /// Per-sink channel depth; 35 chunks is about 100ms at the default format.
    pub sink_buffer_chunks: usize,
    /// How long a sink may stay full before it is detached.
    pub sink_stall_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            chunk_bytes: 256,
            sink_buffer_chunks: 35,
            sink_stall_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturerState {
    Created,
    Open,
    Closed,
}

#[derive(Clone)]
struct SinkHandle {
    id: SinkId,
    label: String,
    tx: mpsc::Sender<CaptureChunk>,
}

struct Lifecycle {
    state: CapturerState,
    loop_thread: Option<JoinHandle<()>>,
}

/// Per-sink delivery bookkeeping owned by the capture loop.
///
/// Chunks a full sink could not take yet stay queued so a briefly slow sink
/// sees no gaps; the queue is bounded in time by the stall timeout.
#[derive(Default)]
struct DeliveryState {
    pending: VecDeque<CaptureChunk>,
    stalled_since: Option<Instant>,
}

pub struct AudioCapturer {
    device: AudioDevice,
    format: AudioFormat,
    options: CaptureOptions,
    backend: Arc<dyn AudioBackend>,
    lifecycle: Mutex<Lifecycle>,
    sinks: Arc<Mutex<Vec<SinkHandle>>>,
    running: Arc<AtomicBool>,
    next_sink_id: AtomicU64,
}

impl AudioCapturer {
    pub fn new(
        device: AudioDevice,
        format: AudioFormat,
        backend: Arc<dyn AudioBackend>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            device,
            format,
            options,
            backend,
            lifecycle: Mutex::new(Lifecycle {
                state: CapturerState::Created,
                loop_thread: None,
            }),
            sinks: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            next_sink_id: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn state(&self) -> CapturerState {
        self.lifecycle.lock().unwrap().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CapturerState::Open
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    /// Acquires the hardware line and starts the capture loop on a dedicated
    /// thread. Returns once the loop is running, not when capture ends.
    pub fn open(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        match lifecycle.state {
            CapturerState::Open => return Ok(()),
            CapturerState::Closed => return Err(HarnessError::SessionClosed),
            CapturerState::Created => {}
        }

        let line = self.backend.open_input(&self.device.id, self.format)?;

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let sinks = self.sinks.clone();
        let options = self.options.clone();
        let device_name = self.device.name.clone();

        let thread = thread::Builder::new()
            .name("audio-capture-loop".to_string())
            .spawn(move || capture_loop(line, running, sinks, options, device_name))?;

        lifecycle.loop_thread = Some(thread);
        lifecycle.state = CapturerState::Open;
        info!("Capture open on {} at {}", self.device.name, self.format);

        Ok(())
    }

    /// Attaches a bounded-channel sink. Valid before or after `open`; a sink
    /// attached while capturing sees chunks from the next produced chunk
    /// onward, never a backfill.
    ///
    /// The capturer keeps the only sender, so every detach path (stall,
    /// disconnect, explicit detach, close) closes the channel and the
    /// consumer observes end-of-stream.
    pub fn attach(&self, label: &str) -> Result<(SinkId, mpsc::Receiver<CaptureChunk>)> {
        // Held across the push so an attach cannot race a concurrent close
        // and land on a capturer that will never end the stream.
        let lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.state == CapturerState::Closed {
            return Err(HarnessError::SessionClosed);
        }

        let (tx, rx) = mpsc::channel(self.options.sink_buffer_chunks);
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        self.sinks.lock().unwrap().push(SinkHandle {
            id,
            label: label.to_string(),
            tx,
        });
        drop(lifecycle);
        debug!("Attached sink {} ({}) to {}", id, label, self.device.name);

        Ok((id, rx))
    }

    /// Removes one sink. Returns false if the sink was already gone.
    pub fn detach(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.lock().unwrap();
        let before = sinks.len();
        sinks.retain(|s| s.id != id);
        let removed = sinks.len() != before;
        if removed {
            debug!("Detached sink {} from {}", id, self.device.name);
        }
        removed
    }

    /// Removes every sink, dropping their senders so consumers see the
    /// streams end.
    pub fn detach_all(&self) -> usize {
        let mut sinks = self.sinks.lock().unwrap();
        let count = sinks.len();
        sinks.clear();
        count
    }

    /// Stops the capture loop and releases the hardware line. Idempotent.
    ///
    /// The loop never blocks on a sink, so the join is bounded by roughly
    /// one frame period.
    pub fn close(&self) {
        let thread = {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if lifecycle.state == CapturerState::Closed {
                return;
            }
            lifecycle.state = CapturerState::Closed;
            self.running.store(false, Ordering::Release);
            // Drop every sender so attached consumers see end-of-stream.
            self.sinks.lock().unwrap().clear();
            lifecycle.loop_thread.take()
        };
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        info!("Capture closed on {}", self.device.name);
    }
}

impl Drop for AudioCapturer {
    fn drop(&mut self) {
        self.close();
    }
}

fn capture_loop(
    mut line: Box<dyn CaptureLine>,
    running: Arc<AtomicBool>,
    sinks: Arc<Mutex<Vec<SinkHandle>>>,
    options: CaptureOptions,
    device_name: String,
) {
    debug!("Capture loop started on {}", device_name);

    let mut sequence: u64 = 0;
    let mut buf = vec![0u8; options.chunk_bytes];
    let mut delivery: HashMap<SinkId, DeliveryState> = HashMap::new();

    while running.load(Ordering::Acquire) {
        let n = match line.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                warn!("Capture read failed on {}: {}", device_name, e);
                break;
            }
        };

        let chunk = CaptureChunk {
            sequence,
            data: Bytes::copy_from_slice(&buf[..n]),
        };
        sequence += 1;

        // Snapshot so attach/detach never contend with per-chunk delivery.
        let snapshot: Vec<SinkHandle> = sinks.lock().unwrap().clone();
        delivery.retain(|id, _| snapshot.iter().any(|s| s.id == *id));

        let mut to_detach: Vec<(SinkId, Option<String>)> = Vec::new();
        for sink in &snapshot {
            let state = delivery.entry(sink.id).or_default();
            state.pending.push_back(chunk.clone());

            while let Some(front) = state.pending.front() {
                match sink.tx.try_send(front.clone()) {
                    Ok(()) => {
                        state.pending.pop_front();
                        state.stalled_since = None;
                    }
                    Err(TrySendError::Full(_)) => {
                        let since = state.stalled_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= options.sink_stall_timeout {
                            to_detach.push((
                                sink.id,
                                Some(format!(
                                    "sink {} ({}) stalled past {:?}",
                                    sink.id, sink.label, options.sink_stall_timeout
                                )),
                            ));
                        }
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        to_detach.push((sink.id, None));
                        break;
                    }
                }
            }
        }

        if !to_detach.is_empty() {
            let mut sinks = sinks.lock().unwrap();
            for (id, reason) in to_detach {
                sinks.retain(|s| s.id != id);
                delivery.remove(&id);
                match reason {
                    // Sink failure is isolated; the session keeps running.
                    Some(reason) => warn!("{}", HarnessError::SinkWrite(reason)),
                    None => debug!("Sink {} disconnected, detached", id),
                }
            }
        }
    }

    line.close();
    debug!(
        "Capture loop on {} stopped after {} chunks",
        device_name, sequence
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MIXER_ONE};
    use crate::registry::AudioDeviceRegistry;
    use tokio::time::timeout;

    fn fixture() -> (Arc<MockBackend>, AudioDevice) {
        let backend = Arc::new(MockBackend::with_fixture_devices());
        let registry = AudioDeviceRegistry::new(backend.clone());
        registry.list_devices();
        let device = registry.resolve(MIXER_ONE).unwrap();
        (backend, device)
    }

    fn test_options() -> CaptureOptions {
        CaptureOptions {
            chunk_bytes: 64,
            sink_buffer_chunks: 8,
            sink_stall_timeout: Duration::from_millis(40),
        }
    }

    async fn recv_sequences(rx: &mut mpsc::Receiver<CaptureChunk>, count: usize) -> Vec<u64> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let chunk = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for chunk")
                .expect("stream ended early");
            out.push(chunk.sequence);
        }
        out
    }

    #[tokio::test]
    async fn test_sinks_receive_gap_free_runs_from_attach_point() {
        let (backend, device) = fixture();
        let capturer = AudioCapturer::new(device, AudioFormat::default(), backend, test_options());

        let (_early_id, mut early_rx) = capturer.attach("early").unwrap();
        capturer.open().unwrap();

        let early = recv_sequences(&mut early_rx, 5).await;
        assert_eq!(early, vec![0, 1, 2, 3, 4]);

        // A late sink starts at the next produced chunk, no backfill.
        let (_late_id, mut late_rx) = capturer.attach("late").unwrap();
        let late = recv_sequences(&mut late_rx, 5).await;
        assert!(late[0] > 0, "late sink must not be backfilled");
        for pair in late.windows(2) {
            assert_eq!(pair[1], pair[0] + 1, "late sink saw a gap: {:?}", late);
        }

        capturer.close();
    }

    #[tokio::test]
    async fn test_stalled_sink_is_detached_responsive_sink_unaffected() {
        let (backend, device) = fixture();
        let capturer = AudioCapturer::new(device, AudioFormat::default(), backend, test_options());

        // This sink never consumes; holding rx open keeps the channel alive.
        let (_stalled_id, mut stalled_rx) = capturer.attach("stalled").unwrap();
        let (_live_id, mut live_rx) = capturer.attach("live").unwrap();
        capturer.open().unwrap();
        assert_eq!(capturer.sink_count(), 2);

        // Drain the responsive sink well past the stall timeout.
        let sequences = recv_sequences(&mut live_rx, 60).await;
        for pair in sequences.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
        assert_eq!(
            capturer.sink_count(),
            1,
            "stalled sink should have been detached"
        );

        // Detach dropped the only sender: the stalled consumer drains what
        // was buffered and then sees end-of-stream rather than pending.
        let ended = timeout(Duration::from_secs(2), async {
            while stalled_rx.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "detached sink must see its stream end");

        capturer.close();
    }

    #[tokio::test]
    async fn test_close_ends_attached_sink_streams() {
        let (backend, device) = fixture();
        let capturer = AudioCapturer::new(device, AudioFormat::default(), backend, test_options());

        let (_id, mut rx) = capturer.attach("observer").unwrap();
        capturer.open().unwrap();
        recv_sequences(&mut rx, 3).await;

        capturer.close();
        assert_eq!(capturer.sink_count(), 0);

        let ended = timeout(Duration::from_secs(2), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "sink stream must end after close");
    }

    #[tokio::test]
    async fn test_disconnected_sink_is_detached() {
        let (backend, device) = fixture();
        let capturer = AudioCapturer::new(device, AudioFormat::default(), backend, test_options());

        let (_id, rx) = capturer.attach("dropped").unwrap();
        let (_live_id, mut live_rx) = capturer.attach("live").unwrap();
        capturer.open().unwrap();

        drop(rx);
        recv_sequences(&mut live_rx, 20).await;
        assert_eq!(capturer.sink_count(), 1);

        capturer.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let (backend, device) = fixture();
        let capturer =
            AudioCapturer::new(device, AudioFormat::default(), backend.clone(), test_options());

        capturer.open().unwrap();
        assert!(backend.line_open(MIXER_ONE));

        capturer.close();
        assert!(!backend.line_open(MIXER_ONE), "line must be released");
        capturer.close(); // no-op

        assert!(matches!(capturer.open(), Err(HarnessError::SessionClosed)));
        assert!(matches!(
            capturer.attach("late"),
            Err(HarnessError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_open_fails_when_line_is_held() {
        let (backend, device) = fixture();
        let first = AudioCapturer::new(
            device.clone(),
            AudioFormat::default(),
            backend.clone(),
            test_options(),
        );
        first.open().unwrap();

        let second = AudioCapturer::new(device, AudioFormat::default(), backend, test_options());
        assert!(matches!(
            second.open(),
            Err(HarnessError::DeviceUnavailable(_))
        ));

        first.close();
    }
}
