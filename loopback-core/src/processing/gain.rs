use std::sync::atomic::{AtomicU32, Ordering};

use crate::models::chunk::AudioChunk;
use crate::models::format::BYTES_PER_SAMPLE;

/// Upper bound of the control surface's gain (100%).
pub const MAX_GAIN: f32 = 1.0;

/// Scale 16-bit little-endian samples in place by `gain`.
///
/// Each sample becomes `round(clamp(s * gain, -32768, 32767))`: overflow
/// saturates instead of wrapping. Negative or NaN gain is treated as 0.
/// Unity gain leaves the bytes untouched. Does not allocate.
pub fn apply_gain(pcm: &mut [u8], gain: f32) {
    if gain == 1.0 {
        return;
    }
    let gain = if gain.is_nan() { 0.0 } else { gain.max(0.0) };

    for pair in pcm.chunks_exact_mut(BYTES_PER_SAMPLE) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32;
        let scaled = (sample * gain)
            .clamp(i16::MIN as f32, i16::MAX as f32)
            .round() as i16;
        pair.copy_from_slice(&scaled.to_le_bytes());
    }
}

pub fn apply_gain_to_chunk(chunk: &mut AudioChunk, gain: f32) {
    apply_gain(chunk.as_bytes_mut(), gain);
}

/// Gain shared between the control thread and the capture dispatcher.
///
/// Stored as the bit pattern of an `f32` in one atomic word, so readers on
/// the audio path never block and never observe a torn value.
#[derive(Debug)]
pub struct GainControl {
    bits: AtomicU32,
}

impl GainControl {
    pub fn new(gain: f32) -> Self {
        Self {
            bits: AtomicU32::new(clamp_gain(gain).to_bits()),
        }
    }

    pub fn from_percent(percent: u8) -> Self {
        Self::new(percent_to_gain(percent))
    }

    /// Takes effect for the next chunk processed.
    pub fn set(&self, gain: f32) {
        self.bits.store(clamp_gain(gain).to_bits(), Ordering::Release);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Values above 100 are treated as 100.
    pub fn set_percent(&self, percent: u8) {
        self.set(percent_to_gain(percent));
    }

    pub fn percent(&self) -> u8 {
        (self.get() * 100.0).round() as u8
    }
}

impl Default for GainControl {
    fn default() -> Self {
        Self::new(MAX_GAIN)
    }
}

fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        0.0
    } else {
        gain.clamp(0.0, MAX_GAIN)
    }
}

fn percent_to_gain(percent: u8) -> f32 {
    percent.min(100) as f32 / 100.0
}
