use std::fmt;

use crate::models::device::Direction;
use crate::models::error::LoopbackError;
use crate::models::format::AudioFormat;
use crate::traits::backend::{
    AudioBackend, BufferToken, CompletionSender, DeviceStream, SubmitError,
};

/// Owned handle to one opened endpoint at a fixed format.
///
/// [`DeviceHandle::close`] consumes the handle, so nothing can be issued
/// against a closed endpoint. Dropping an unclosed handle closes it.
pub struct DeviceHandle {
    stream: Option<Box<dyn DeviceStream>>,
    direction: Direction,
    index: usize,
    format: AudioFormat,
}

impl DeviceHandle {
    pub fn open(
        backend: &dyn AudioBackend,
        direction: Direction,
        index: usize,
        format: AudioFormat,
        events: CompletionSender,
    ) -> Result<Self, LoopbackError> {
        format.validate()?;
        let stream = backend.open(direction, index, format, events)?;
        log::info!("Opened {:?} device {} at {}", direction, index, format);
        Ok(Self {
            stream: Some(stream),
            direction,
            index,
            format,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn submit(&self, token: BufferToken, buffer: Vec<u8>) -> Result<(), SubmitError> {
        match &self.stream {
            Some(stream) => stream.submit(token, buffer),
            None => Err(SubmitError {
                error: LoopbackError::DeviceUnavailable,
                token,
                buffer,
            }),
        }
    }

    pub fn start(&self) -> Result<(), LoopbackError> {
        match &self.stream {
            Some(stream) => stream.start(),
            None => Err(LoopbackError::DeviceUnavailable),
        }
    }

    pub fn reset(&self) -> Result<(), LoopbackError> {
        match &self.stream {
            Some(stream) => stream.reset(),
            None => Ok(()),
        }
    }

    /// Release the endpoint. Never fails; backend errors are logged.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        match stream.close() {
            Ok(()) => log::info!("Closed {:?} device {}", self.direction, self.index),
            Err(e) => log::error!(
                "Failed to close {:?} device {}: {}",
                self.direction,
                self.index,
                e
            ),
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("direction", &self.direction)
            .field("index", &self.index)
            .field("format", &self.format)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crossbeam::channel;

    use super::*;
    use crate::backend::virtual_device::{ClockMode, Signal, VirtualBackend};

    fn backend() -> VirtualBackend {
        VirtualBackend::new(ClockMode::Manual)
            .with_input("Line In", Signal::Silence)
            .with_output("Speakers")
    }

    #[test]
    fn open_validates_the_format_first() {
        let backend = backend();
        let (tx, _rx) = channel::unbounded();
        let six_channels = AudioFormat::new(44_100, 6);
        let result = DeviceHandle::open(&backend, Direction::Input, 0, six_channels, tx);
        assert_eq!(result.err(), Some(LoopbackError::FormatUnsupported));
        assert_eq!(backend.open_count(Direction::Input, 0), 0);
    }

    #[test]
    fn open_reports_missing_device() {
        let backend = backend();
        let (tx, _rx) = channel::unbounded();
        let result = DeviceHandle::open(&backend, Direction::Output, 5, AudioFormat::default(), tx);
        assert_eq!(result.err(), Some(LoopbackError::DeviceUnavailable));
    }

    #[test]
    fn close_releases_the_endpoint_once() {
        let backend = backend();
        let (tx, _rx) = channel::unbounded();
        let handle =
            DeviceHandle::open(&backend, Direction::Output, 0, AudioFormat::default(), tx).unwrap();
        assert_eq!(handle.direction(), Direction::Output);
        assert_eq!(handle.index(), 0);

        handle.close();
        assert!(!backend.is_open(Direction::Output, 0));
        assert_eq!(backend.close_count(Direction::Output, 0), 1);
    }

    #[test]
    fn dropping_an_open_handle_closes_it() {
        let backend = backend();
        let (tx, _rx) = channel::unbounded();
        let handle =
            DeviceHandle::open(&backend, Direction::Input, 0, AudioFormat::default(), tx).unwrap();
        drop(handle);
        assert!(!backend.is_open(Direction::Input, 0));
        assert_eq!(backend.close_count(Direction::Input, 0), 1);
    }

    #[test]
    fn submit_and_reset_reach_the_device() {
        let backend = backend();
        let (tx, rx) = channel::unbounded();
        let handle =
            DeviceHandle::open(&backend, Direction::Output, 0, AudioFormat::default(), tx).unwrap();
        handle.submit(BufferToken::new(0, 1), vec![0; 4]).unwrap();
        assert_eq!(backend.queued(Direction::Output, 0), 1);

        handle.reset().unwrap();
        assert_eq!(backend.queued(Direction::Output, 0), 0);
        assert_eq!(rx.try_iter().count(), 1);
    }
}
