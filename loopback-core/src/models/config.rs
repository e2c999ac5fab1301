use serde::{Deserialize, Serialize};

use super::error::LoopbackError;
use super::format::AudioFormat;

/// Configuration for a loopback coordinator.
///
/// Deserializes with defaults for missing fields, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Device format for both capture and playback (default: 44100 Hz mono).
    pub format: AudioFormat,

    /// Capture buffers kept queued at the device (default: 4).
    pub capture_buffer_count: usize,

    /// Audio per capture buffer in milliseconds (default: 20).
    pub buffer_duration_ms: u32,

    /// Upper bound on playback buffers in flight (default: 32).
    pub max_playback_buffers: usize,

    /// Consecutive consumer faults before capture suspends delivery (default: 50).
    pub max_consecutive_faults: u32,

    /// Gain applied when a coordinator is created, 0..=100 (default: 100).
    pub initial_gain_percent: u8,
}

impl LoopbackConfig {
    pub fn validate(&self) -> Result<(), LoopbackError> {
        self.format.validate()?;
        if self.capture_buffer_count == 0 {
            return Err(LoopbackError::InvalidConfiguration(
                "capture buffer count must be positive".into(),
            ));
        }
        if self.capture_buffer_bytes() == 0 {
            return Err(LoopbackError::InvalidConfiguration(format!(
                "{} ms holds no whole frame at {}",
                self.buffer_duration_ms, self.format
            )));
        }
        if self.max_playback_buffers == 0 {
            return Err(LoopbackError::InvalidConfiguration(
                "playback buffer limit must be positive".into(),
            ));
        }
        if self.max_consecutive_faults == 0 {
            return Err(LoopbackError::InvalidConfiguration(
                "fault limit must be positive".into(),
            ));
        }
        if self.initial_gain_percent > 100 {
            return Err(LoopbackError::InvalidConfiguration(format!(
                "gain {}% out of range 0..=100",
                self.initial_gain_percent
            )));
        }
        Ok(())
    }

    /// Byte size of one capture buffer.
    pub fn capture_buffer_bytes(&self) -> usize {
        self.format.bytes_for_millis(self.buffer_duration_ms)
    }
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            capture_buffer_count: 4,
            buffer_duration_ms: 20,
            max_playback_buffers: 32,
            max_consecutive_faults: 50,
            initial_gain_percent: 100,
        }
    }
}
