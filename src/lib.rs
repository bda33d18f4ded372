/*!
 * Audio Test Harness Library
 *
 * Host audio capture with shared per-device sessions, fan-out to bounded
 * consumers, and a gRPC streaming surface.
 */

pub mod backend;
pub mod capture;
pub mod chunk;
pub mod error;
pub mod format;
pub mod registry;
pub mod server;
pub mod session;
pub mod sink;

// Include generated proto code
pub mod proto_gen {
    pub mod audioharness {
        tonic::include_proto!("audioharness");
    }
}

// Re-export commonly used types
pub use capture::{AudioCapturer, CaptureOptions, CapturerState, SinkId};
pub use chunk::CaptureChunk;
pub use error::{HarnessError, Result};
pub use format::{AudioFormat, SampleEncoding};
pub use registry::{AudioDevice, AudioDeviceRegistry, Capability};
pub use server::AudioHarnessService;
pub use session::{CaptureSession, CaptureSessionManager};
pub use sink::FileSink;
