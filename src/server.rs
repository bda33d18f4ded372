/*!
 * gRPC Service Implementation
 *
 * Exposes device enumeration and the capture stream over the wire. The
 * service owns nothing itself; it translates requests into registry and
 * session-manager calls and maps domain errors onto gRPC status codes.
 */

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};
use uuid::Uuid;

use crate::capture::SinkId;
use crate::error::HarnessError;
use crate::format::{AudioFormat, SampleEncoding};
use crate::proto_gen::audioharness as pb;
use crate::proto_gen::audioharness::audio_harness_server::{AudioHarness, AudioHarnessServer};
use crate::registry::{AudioDeviceRegistry, Capability};
use crate::session::CaptureSessionManager;

pub struct AudioHarnessService {
    registry: Arc<AudioDeviceRegistry>,
    sessions: Arc<CaptureSessionManager>,
}

impl AudioHarnessService {
    pub fn new(registry: Arc<AudioDeviceRegistry>, sessions: Arc<CaptureSessionManager>) -> Self {
        Self { registry, sessions }
    }

    pub fn server(self) -> AudioHarnessServer<Self> {
        AudioHarnessServer::new(self)
    }
}

fn device_to_proto(device: &crate::registry::AudioDevice) -> pb::AudioDevice {
    pb::AudioDevice {
        id: device.id.clone(),
        name: device.name.clone(),
        capabilities: device
            .capabilities
            .iter()
            .map(|c| match c {
                Capability::Capture => pb::DeviceCapability::Capture as i32,
                Capability::Playback => pb::DeviceCapability::Playback as i32,
            })
            .collect(),
    }
}

fn format_from_proto(format: &pb::AudioFormat) -> Result<AudioFormat, Status> {
    let encoding = match format.encoding() {
        pb::SampleEncoding::PcmSignedLe => SampleEncoding::PcmSignedLe,
        pb::SampleEncoding::PcmSignedBe => SampleEncoding::PcmSignedBe,
        pb::SampleEncoding::PcmUnsignedLe => SampleEncoding::PcmUnsignedLe,
        pb::SampleEncoding::PcmUnsignedBe => SampleEncoding::PcmUnsignedBe,
        pb::SampleEncoding::Unspecified => {
            return Err(Status::invalid_argument("sample encoding must be set"))
        }
    };
    if format.sample_rate == 0 || format.bit_depth == 0 || format.channels == 0 {
        return Err(Status::invalid_argument(
            "sample_rate, bit_depth and channels must be non-zero",
        ));
    }
    let bit_depth = u16::try_from(format.bit_depth)
        .map_err(|_| Status::invalid_argument("bit_depth out of range"))?;
    let channels = u16::try_from(format.channels)
        .map_err(|_| Status::invalid_argument("channels out of range"))?;
    Ok(AudioFormat {
        sample_rate: format.sample_rate,
        bit_depth,
        channels,
        encoding,
    })
}

/// Detaches the RPC's sink (and reaps the session if it was the last one)
/// when the response stream is torn down, whether the client cancelled or
/// the capture loop ended the stream.
struct StreamGuard {
    sessions: Arc<CaptureSessionManager>,
    session_id: Uuid,
    sink_id: SinkId,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = self.session_id;
        let sink_id = self.sink_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                sessions.release_stream_sink(session_id, sink_id).await;
            });
        }
    }
}

#[tonic::async_trait]
impl AudioHarness for AudioHarnessService {
    type CaptureStream = Pin<Box<dyn Stream<Item = Result<pb::CaptureChunk, Status>> + Send>>;

    async fn list_devices(
        &self,
        _request: Request<pb::ListDevicesRequest>,
    ) -> Result<Response<pb::ListDevicesResponse>, Status> {
        let devices = self.registry.list_devices();
        debug!("ListDevices returning {} devices", devices.len());

        Ok(Response::new(pb::ListDevicesResponse {
            devices: devices.iter().map(device_to_proto).collect(),
        }))
    }

    async fn capture(
        &self,
        request: Request<pb::CaptureRequest>,
    ) -> Result<Response<Self::CaptureStream>, Status> {
        let req = request.into_inner();
        info!("Capture called for device '{}'", req.device);

        // Re-enumerate so a device plugged in since the last call resolves.
        self.registry.list_devices();
        let device = self.registry.resolve(&req.device)?;
        if !device.can_capture() {
            return Err(HarnessError::DeviceUnavailable(format!(
                "{} has no capture capability",
                device.name
            ))
            .into());
        }

        let format = match &req.format {
            Some(f) => format_from_proto(f)?,
            None => AudioFormat::default(),
        };

        let session = self.sessions.get_or_create(&device, format).await?;
        let session_id = session.id();
        let (sink_id, mut rx) = session.attach_stream("grpc")?;
        info!(
            "Streaming session {} sink {} on {} at {}",
            session_id, sink_id, device.name, format
        );

        let guard = StreamGuard {
            sessions: self.sessions.clone(),
            session_id,
            sink_id,
        };

        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(chunk) = rx.recv().await {
                yield Ok(pb::CaptureChunk {
                    sequence: chunk.sequence,
                    data: chunk.data.to_vec(),
                });
            }
            debug!("Capture stream for session {} sink {} ended", session_id, sink_id);
        };

        Ok(Response::new(Box::pin(stream) as Self::CaptureStream))
    }
}
