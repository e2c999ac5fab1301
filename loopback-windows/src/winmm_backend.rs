use loopback_core::models::device::{DeviceInfo, Direction};
use loopback_core::models::error::LoopbackError;
use loopback_core::models::format::AudioFormat;
use loopback_core::traits::backend::{AudioBackend, CompletionSender, DeviceStream};

use crate::device_enumerator::DeviceEnumerator;
use crate::wave_stream::WaveStream;

/// [`AudioBackend`] over the WinMM wave API.
///
/// Stateless: every `open` creates an independent [`WaveStream`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WinmmBackend;

impl WinmmBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for WinmmBackend {
    fn list_devices(&self, direction: Direction) -> Result<Vec<DeviceInfo>, LoopbackError> {
        Ok(match direction {
            Direction::Input => DeviceEnumerator::list_input_devices(),
            Direction::Output => DeviceEnumerator::list_output_devices(),
        })
    }

    fn open(
        &self,
        direction: Direction,
        index: usize,
        format: AudioFormat,
        events: CompletionSender,
    ) -> Result<Box<dyn DeviceStream>, LoopbackError> {
        let stream = WaveStream::open(direction, index, format, events)?;
        Ok(Box::new(stream))
    }
}
