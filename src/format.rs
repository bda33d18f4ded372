/*!
 * PCM format description.
 *
 * An AudioFormat both opens a hardware line and tells clients how to decode
 * the raw bytes they receive; equality is structural.
 */

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sample encoding of a PCM byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleEncoding {
    PcmSignedLe,
    PcmSignedBe,
    PcmUnsignedLe,
    PcmUnsignedBe,
}

impl SampleEncoding {
    pub fn is_signed(&self) -> bool {
        matches!(self, SampleEncoding::PcmSignedLe | SampleEncoding::PcmSignedBe)
    }

    pub fn is_little_endian(&self) -> bool {
        matches!(self, SampleEncoding::PcmSignedLe | SampleEncoding::PcmUnsignedLe)
    }
}

/// Audio capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
    pub encoding: SampleEncoding,
}

impl Default for AudioFormat {
    fn default() -> Self {
        // CD-quality mono: one 256-byte chunk is about 2.9ms of audio.
        Self {
            sample_rate: 44_100,
            bit_depth: 16,
            channels: 1,
            encoding: SampleEncoding::PcmSignedLe,
        }
    }
}

impl AudioFormat {
    /// Bytes in one frame (one sample per channel).
    pub fn bytes_per_frame(&self) -> usize {
        (self.bit_depth as usize / 8) * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.bytes_per_frame() * self.sample_rate as usize
    }

    /// Number of whole frames contained in `bytes`.
    pub fn frames_in(&self, bytes: usize) -> usize {
        bytes / self.bytes_per_frame()
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}bit/{}ch {:?}",
            self.sample_rate, self.bit_depth, self.channels, self.encoding
        )
    }
}
