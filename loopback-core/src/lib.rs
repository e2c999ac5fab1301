//! # loopback-core
//!
//! Platform-agnostic audio loopback core.
//!
//! Captures from one input device, applies a live-adjustable gain, and plays
//! the result on one output device. Platform backends (Windows WinMM, the
//! software `VirtualBackend`) implement the `AudioBackend` trait and plug
//! into the generic `LoopbackCoordinator`.
//!
//! ## Architecture
//!
//! ```text
//! loopback-core (this crate)
//! ├── traits/       ← AudioBackend, DeviceStream, ChunkCallback
//! ├── models/       ← LoopbackError, AudioFormat, AudioChunk, LoopbackConfig, DeliveryStats
//! ├── device/       ← DeviceHandle (owned open endpoint)
//! ├── processing/   ← BufferPool, gain stage
//! ├── engine/       ← CaptureEngine, PlaybackEngine (one dispatcher thread each)
//! ├── session/      ← LoopbackCoordinator (control surface)
//! └── backend/      ← VirtualBackend (software devices)
//! ```

pub mod backend;
pub mod device;
pub mod engine;
pub mod models;
pub mod processing;
pub mod session;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use backend::virtual_device::{ClockMode, Signal, VirtualBackend};
pub use device::handle::DeviceHandle;
pub use engine::capture::CaptureEngine;
pub use engine::playback::PlaybackEngine;
pub use models::chunk::AudioChunk;
pub use models::config::LoopbackConfig;
pub use models::device::{DeviceInfo, Direction};
pub use models::error::{DeliveryFault, LoopbackError};
pub use models::format::AudioFormat;
pub use models::state::EngineState;
pub use models::stats::{DeliveryStats, DeliveryStatsSnapshot, LoopbackDiagnostics};
pub use processing::buffer_pool::{BufferPool, BufferState, PoolBuffer, PoolCounts};
pub use processing::gain::{apply_gain, apply_gain_to_chunk, GainControl};
pub use session::coordinator::{LoopbackCoordinator, SessionInfo};
pub use traits::backend::{
    AudioBackend, BufferToken, Completion, CompletionReceiver, CompletionSender, DeviceStream,
    StreamEvent, SubmitError,
};
pub use traits::chunk_sink::ChunkCallback;
