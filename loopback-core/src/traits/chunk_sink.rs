use std::sync::Arc;

use crate::models::chunk::AudioChunk;
use crate::models::error::DeliveryFault;

/// Callback invoked with every captured chunk.
///
/// Runs on the capture dispatcher thread, once per completed buffer. Keep it
/// to a copy: anything slow delays the resubmission of the capture buffer.
/// Returning an error (or panicking) is counted as a consumer fault;
/// [`DeliveryFault::TransientDrop`] is counted as a drop instead.
pub type ChunkCallback =
    Arc<dyn Fn(AudioChunk) -> Result<(), DeliveryFault> + Send + Sync + 'static>;
