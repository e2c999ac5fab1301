use thiserror::Error;

/// Errors surfaced synchronously by the control surface.
///
/// `open`/`start` failures leave nothing allocated. Steady-state problems
/// on the delivery path are [`DeliveryFault`]s instead and never reach the
/// caller of `start`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoopbackError {
    #[error("device not available")]
    DeviceUnavailable,

    #[error("audio format not supported by the device")]
    FormatUnsupported,

    #[error("a loopback session is already running on other devices")]
    AlreadyRunning,

    #[error("chunk length {len} is not a multiple of the {block_align}-byte frame")]
    MisalignedChunk { len: usize, block_align: usize },

    #[error("engine already stopped")]
    EngineStopped,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Faults on the audio delivery path. Counted and logged, never propagated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryFault {
    #[error("no free buffer, chunk dropped")]
    TransientDrop,

    #[error("chunk consumer failed: {0}")]
    CallbackFault(String),
}
