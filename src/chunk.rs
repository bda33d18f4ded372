//! One sequence-numbered unit of raw captured audio.

use bytes::Bytes;

/// Raw PCM chunk produced by a capture loop.
///
/// Sequence numbers are strictly increasing within a session with no gaps;
/// the payload is cheap to clone so one chunk can fan out to many sinks.
#[derive(Debug, Clone)]
pub struct CaptureChunk {
    pub sequence: u64,
    pub data: Bytes,
}

impl CaptureChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
