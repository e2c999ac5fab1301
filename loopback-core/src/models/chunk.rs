use super::error::LoopbackError;
use super::format::{AudioFormat, BYTES_PER_SAMPLE};

/// Owned block of interleaved 16-bit little-endian PCM.
///
/// The length is always a whole number of frames. A chunk is created by the
/// capture engine for every completed buffer and moves by value through the
/// pipeline until the playback engine copies it into a device buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    bytes: Vec<u8>,
    format: AudioFormat,
}

impl AudioChunk {
    pub fn new(bytes: Vec<u8>, format: AudioFormat) -> Result<Self, LoopbackError> {
        let block_align = format.block_align();
        if block_align == 0 || bytes.len() % block_align != 0 {
            return Err(LoopbackError::MisalignedChunk {
                len: bytes.len(),
                block_align,
            });
        }
        Ok(Self { bytes, format })
    }

    /// Copy the whole frames out of `bytes`, discarding a trailing partial frame.
    pub fn copy_from(bytes: &[u8], format: AudioFormat) -> Self {
        let block_align = format.block_align().max(1);
        let whole = bytes.len() - bytes.len() % block_align;
        Self {
            bytes: bytes[..whole].to_vec(),
            format,
        }
    }

    pub fn from_samples(samples: &[i16], format: AudioFormat) -> Result<Self, LoopbackError> {
        let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Self::new(bytes, format)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn frames(&self) -> usize {
        self.bytes.len() / self.format.block_align().max(1)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable view of the PCM bytes. The length cannot change through it.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }

    /// Largest absolute sample value.
    pub fn peak_amplitude(&self) -> u16 {
        self.samples().map(|s| s.unsigned_abs()).max().unwrap_or(0)
    }
}
