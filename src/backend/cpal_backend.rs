/*!
 * cpal-based host audio backend.
 *
 * cpal input streams are not Send, so each open line runs its stream on a
 * dedicated thread; the stream callback pushes converted PCM bytes into a
 * heap ring buffer whose consumer half is read by the capture loop.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, StreamConfig};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tracing::{debug, warn};

use super::{AudioBackend, BackendDevice, CaptureLine};
use crate::error::{HarnessError, Result};
use crate::format::AudioFormat;

/// Upper bound on one blocking read from a line.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Backend over the host's default cpal audio host.
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// cpal exposes no id distinct from the name, so the name is the identity;
/// repeated names get a `#index` suffix to keep ids unique within one
/// enumeration pass.
fn unique_device_id(seen: &mut HashMap<String, usize>, name: &str) -> String {
    let count = seen.entry(name.to_string()).or_insert(0);
    let id = if *count == 0 {
        name.to_string()
    } else {
        format!("{}#{}", name, count)
    };
    *count += 1;
    id
}

/// Inverse of `unique_device_id`: the device name and its duplicate index.
fn split_device_id(id: &str) -> (&str, usize) {
    match id.rsplit_once('#') {
        Some((name, index)) if !name.is_empty() => match index.parse::<usize>() {
            Ok(index) => (name, index),
            Err(_) => (id, 0),
        },
        _ => (id, 0),
    }
}

impl AudioBackend for CpalBackend {
    fn enumerate(&self) -> Vec<BackendDevice> {
        let host = cpal::default_host();
        let devices = match host.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Host device enumeration failed: {}", e);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        let mut seen = HashMap::new();
        for device in devices {
            let name = match device.name() {
                Ok(name) => name,
                Err(e) => {
                    debug!("Skipping device with unreadable name: {}", e);
                    continue;
                }
            };
            let has_input = device
                .supported_input_configs()
                .map(|mut configs| configs.next().is_some())
                .unwrap_or(false);
            let has_output = device
                .supported_output_configs()
                .map(|mut configs| configs.next().is_some())
                .unwrap_or(false);

            out.push(BackendDevice {
                id: unique_device_id(&mut seen, &name),
                name,
                has_input,
                has_output,
            });
        }
        out
    }

    fn open_input(&self, device_id: &str, format: AudioFormat) -> Result<Box<dyn CaptureLine>> {
        let line = CpalCaptureLine::open(device_id, format)?;
        Ok(Box::new(line))
    }
}

/// One open cpal input stream, pumping into a byte ring buffer.
struct CpalCaptureLine {
    consumer: HeapCons<u8>,
    stop: Arc<AtomicBool>,
    overrun_bytes: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl CpalCaptureLine {
    fn open(device_id: &str, format: AudioFormat) -> Result<Self> {
        if format.bit_depth != 16 {
            return Err(HarnessError::DeviceUnavailable(format!(
                "unsupported bit depth {} (16-bit PCM only)",
                format.bit_depth
            )));
        }

        // Hold about one second of audio between the callback and the reader.
        let ring = HeapRb::<u8>::new(format.bytes_per_second().max(8192));
        let (producer, consumer) = ring.split();
        let stop = Arc::new(AtomicBool::new(false));
        let overrun_bytes = Arc::new(AtomicU64::new(0));

        let (open_tx, open_rx) = mpsc::channel::<Result<()>>();
        let thread_stop = stop.clone();
        let thread_overruns = overrun_bytes.clone();
        let id = device_id.to_string();

        let thread = thread::Builder::new()
            .name("audio-capture-line".to_string())
            .spawn(move || {
                stream_thread(id, format, producer, thread_stop, thread_overruns, open_tx)
            })
            .map_err(|e| {
                HarnessError::DeviceUnavailable(format!("line thread spawn failed: {}", e))
            })?;

        // Wait for the stream to start (or fail) before reporting the line open.
        match open_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                consumer,
                stop,
                overrun_bytes,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(HarnessError::DeviceUnavailable(
                    "line thread exited before stream start".to_string(),
                ))
            }
        }
    }
}

impl CaptureLine for CpalCaptureLine {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let deadline = Instant::now() + READ_TIMEOUT;
        let mut filled = 0;

        loop {
            filled += self.consumer.pop_slice(&mut buf[filled..]);
            if filled == buf.len()
                || self.stop.load(Ordering::Acquire)
                || Instant::now() >= deadline
            {
                return Ok(filled);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
        let overruns = self.overrun_bytes.load(Ordering::Relaxed);
        if overruns > 0 {
            warn!("Capture line dropped {} bytes on ring overrun", overruns);
        }
    }
}

impl Drop for CpalCaptureLine {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_device(device_id: &str) -> Result<cpal::Device> {
    let host = cpal::default_host();
    let devices: Vec<cpal::Device> = host
        .devices()
        .map_err(|e| HarnessError::DeviceUnavailable(e.to_string()))?
        .collect();

    let nth_by_name = |name: &str, index: usize| {
        devices
            .iter()
            .filter(|d| d.name().map(|n| n == name).unwrap_or(false))
            .nth(index)
            .cloned()
    };

    // Exact name first, covering names that themselves contain '#'; then the
    // "name#index" form assigned to duplicates.
    if let Some(device) = nth_by_name(device_id, 0) {
        return Ok(device);
    }
    let (name, index) = split_device_id(device_id);
    nth_by_name(name, index).ok_or_else(|| {
        HarnessError::DeviceUnavailable(format!("device {} no longer present", device_id))
    })
}

/// Owns the cpal stream for the lifetime of the line.
fn stream_thread(
    device_id: String,
    format: AudioFormat,
    mut producer: HeapProd<u8>,
    stop: Arc<AtomicBool>,
    overrun_bytes: Arc<AtomicU64>,
    open_tx: mpsc::Sender<Result<()>>,
) {
    let device = match find_device(&device_id) {
        Ok(device) => device,
        Err(e) => {
            let _ = open_tx.send(Err(e));
            return;
        }
    };

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    };

    let little_endian = format.encoding.is_little_endian();
    let err_fn = |e: cpal::StreamError| warn!("Capture stream error: {}", e);

    let stream = if format.encoding.is_signed() {
        let overruns = overrun_bytes.clone();
        device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let mut bytes = Vec::with_capacity(data.len() * 2);
                for sample in data {
                    if little_endian {
                        bytes.extend_from_slice(&sample.to_le_bytes());
                    } else {
                        bytes.extend_from_slice(&sample.to_be_bytes());
                    }
                }
                let written = producer.push_slice(&bytes);
                if written < bytes.len() {
                    overruns.fetch_add((bytes.len() - written) as u64, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
    } else {
        let overruns = overrun_bytes.clone();
        device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let mut bytes = Vec::with_capacity(data.len() * 2);
                for sample in data {
                    if little_endian {
                        bytes.extend_from_slice(&sample.to_le_bytes());
                    } else {
                        bytes.extend_from_slice(&sample.to_be_bytes());
                    }
                }
                let written = producer.push_slice(&bytes);
                if written < bytes.len() {
                    overruns.fetch_add((bytes.len() - written) as u64, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = open_tx.send(Err(HarnessError::DeviceUnavailable(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = open_tx.send(Err(HarnessError::DeviceUnavailable(e.to_string())));
        return;
    }

    let _ = open_tx.send(Ok(()));
    debug!("Capture line open on {} at {}", device_id, format);

    while !stop.load(Ordering::Acquire) {
        thread::park_timeout(Duration::from_millis(100));
    }

    // Dropping the stream releases the hardware line.
    drop(stream);
    debug!("Capture line on {} released", device_id);
}
