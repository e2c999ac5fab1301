use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::LoopbackError;

/// Sample depth is fixed; no format conversion happens anywhere in the pipeline.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Bytes in one 16-bit sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// PCM format shared by both sides of a loopback session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate_hz: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate_hz: u32, channels: u16) -> Self {
        Self {
            sample_rate_hz,
            channels,
        }
    }

    pub const fn mono(sample_rate_hz: u32) -> Self {
        Self::new(sample_rate_hz, 1)
    }

    pub const fn stereo(sample_rate_hz: u32) -> Self {
        Self::new(sample_rate_hz, 2)
    }

    pub fn bits_per_sample(&self) -> u16 {
        BITS_PER_SAMPLE
    }

    /// Bytes per interleaved frame (`channels * 2`).
    pub fn block_align(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate_hz as usize * self.block_align()
    }

    /// Whole-frame byte count covering `millis` of audio.
    ///
    /// 20 ms at 44.1 kHz mono is 882 frames, 1764 bytes.
    pub fn bytes_for_millis(&self, millis: u32) -> usize {
        let frames = self.sample_rate_hz as u64 * millis as u64 / 1000;
        frames as usize * self.block_align()
    }

    pub fn validate(&self) -> Result<(), LoopbackError> {
        if self.sample_rate_hz == 0 || !(1..=2).contains(&self.channels) {
            return Err(LoopbackError::FormatUnsupported);
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    /// 44.1 kHz mono, the monitor's fixed device format.
    fn default() -> Self {
        Self::mono(44_100)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = match self.channels {
            1 => "mono",
            2 => "stereo",
            _ => "unsupported",
        };
        write!(
            f,
            "{} Hz, {}, {}-bit",
            self.sample_rate_hz, layout, BITS_PER_SAMPLE
        )
    }
}
