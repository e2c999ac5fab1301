use crossbeam::channel::{Receiver, Sender};

use crate::models::device::{DeviceInfo, Direction};
use crate::models::error::LoopbackError;
use crate::models::format::AudioFormat;

/// Identifies one lending of a pool buffer to a device.
///
/// The generation changes every time a slot is handed to hardware, so a
/// token from an earlier lending never matches the slot again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferToken {
    slot: u32,
    generation: u32,
}

impl BufferToken {
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// A buffer handed back by the device.
///
/// `bytes` is how much of `buffer` the device filled (capture) or played
/// (playback). Capture may report less than the buffer length at stream
/// edges and zero for buffers flushed by a reset.
#[derive(Debug)]
pub struct Completion {
    pub token: BufferToken,
    pub buffer: Vec<u8>,
    pub bytes: usize,
}

/// Messages consumed by an engine's completion dispatcher.
#[derive(Debug)]
pub enum StreamEvent {
    Completed(Completion),
    /// Sent by the owning engine after a reset; never by a device.
    Shutdown,
}

pub type CompletionSender = Sender<StreamEvent>;
pub type CompletionReceiver = Receiver<StreamEvent>;

/// A buffer the device refused, returned to the caller intact.
#[derive(Debug)]
pub struct SubmitError {
    pub error: LoopbackError,
    pub token: BufferToken,
    pub buffer: Vec<u8>,
}

/// Platform audio subsystem: enumerates endpoints and opens streams.
///
/// Implemented by:
/// - `VirtualBackend` (software devices, this crate)
/// - `WinmmBackend` (Windows waveIn/waveOut)
pub trait AudioBackend: Send + Sync {
    /// Endpoints in index order.
    fn list_devices(&self, direction: Direction) -> Result<Vec<DeviceInfo>, LoopbackError>;

    /// Open endpoint `index` at `format`.
    ///
    /// Every buffer later passed to [`DeviceStream::submit`] comes back
    /// exactly once as a [`StreamEvent::Completed`] on `events`, sent from a
    /// thread the backend owns, unless the stream is closed first.
    fn open(
        &self,
        direction: Direction,
        index: usize,
        format: AudioFormat,
        events: CompletionSender,
    ) -> Result<Box<dyn DeviceStream>, LoopbackError>;
}

/// One open endpoint.
///
/// Methods take `&self`: a dispatcher resubmitting buffers and a control
/// thread resetting the stream may call in concurrently.
pub trait DeviceStream: Send + Sync {
    fn format(&self) -> AudioFormat;

    /// Hand `buffer` to the device. Ownership stays with the device until its
    /// completion is sent.
    fn submit(&self, token: BufferToken, buffer: Vec<u8>) -> Result<(), SubmitError>;

    /// Begin delivering capture completions. Output streams play on submit
    /// and treat this as a no-op.
    fn start(&self) -> Result<(), LoopbackError>;

    /// Halt and flush. Blocks until every queued buffer has been sent back
    /// as a completion.
    fn reset(&self) -> Result<(), LoopbackError>;

    /// Release the endpoint. Buffers still queued are freed without a
    /// completion.
    fn close(self: Box<Self>) -> Result<(), LoopbackError>;
}
