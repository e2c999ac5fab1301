//! Playback engine.
//!
//! Each chunk is copied into a pool buffer and queued at the output device
//! straight away; buffers come back to the pool as the device finishes them.
//! Never blocks the caller: with every buffer in flight the chunk is dropped.

use std::sync::Arc;
use std::thread;

use crossbeam::channel;
use parking_lot::{Mutex, RwLock};

use super::join_dispatcher;
use crate::device::handle::DeviceHandle;
use crate::models::chunk::AudioChunk;
use crate::models::config::LoopbackConfig;
use crate::models::device::Direction;
use crate::models::error::{DeliveryFault, LoopbackError};
use crate::models::format::AudioFormat;
use crate::models::stats::{should_log, DeliveryStats, DeliveryStatsSnapshot};
use crate::processing::buffer_pool::{BufferPool, PoolCounts, StaleToken};
use crate::traits::backend::{
    AudioBackend, Completion, CompletionReceiver, CompletionSender, StreamEvent,
};

struct PlaybackShared {
    pool: Mutex<BufferPool>,
    stats: Arc<DeliveryStats>,
}

/// Queued playback to one output device.
pub struct PlaybackEngine {
    shared: Arc<PlaybackShared>,
    /// `None` once disposed. Readers are `play` calls in flight.
    device: RwLock<Option<DeviceHandle>>,
    format: AudioFormat,
    device_index: usize,
    events: CompletionSender,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PlaybackEngine {
    /// Open the output device. Buffers are allocated lazily, up to
    /// `config.max_playback_buffers`.
    pub fn open(
        backend: &dyn AudioBackend,
        device_index: usize,
        config: &LoopbackConfig,
        stats: Arc<DeliveryStats>,
    ) -> Result<Self, LoopbackError> {
        config.validate()?;

        let (events, receiver) = channel::unbounded();
        let device = DeviceHandle::open(
            backend,
            Direction::Output,
            device_index,
            config.format,
            events.clone(),
        )?;

        let shared = Arc::new(PlaybackShared {
            pool: Mutex::new(BufferPool::growable(config.max_playback_buffers)),
            stats,
        });

        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("loopback-playback".into())
                .spawn(move || run_dispatcher(shared, receiver))
                .map_err(|e| {
                    LoopbackError::Backend(format!("failed to spawn playback dispatcher: {}", e))
                })?
        };

        Ok(Self {
            shared,
            device: RwLock::new(Some(device)),
            format: config.format,
            device_index,
            events,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Queue one chunk for output.
    ///
    /// The pool grows on demand, but only up to `max_playback_buffers`. Once
    /// that many buffers are in flight the chunk is dropped instead of
    /// growing further, bounding output latency and memory.
    ///
    /// Safe to call from a capture dispatcher. Returns
    /// [`DeliveryFault::TransientDrop`] when the chunk could not be queued.
    pub fn play(&self, chunk: AudioChunk) -> Result<(), DeliveryFault> {
        if chunk.format() != self.format {
            return Err(DeliveryFault::CallbackFault(format!(
                "chunk is {} but playback runs at {}",
                chunk.format(),
                self.format
            )));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        let guard = self.device.read();
        let Some(device) = guard.as_ref() else {
            return Err(self.drop_chunk("playback already disposed"));
        };

        let Some(mut buffer) = self.shared.pool.lock().acquire_for(chunk.len()) else {
            return Err(self.drop_chunk("every playback buffer is in flight"));
        };
        buffer.fill(chunk.as_bytes());
        let (token, data) = self.shared.pool.lock().submit(buffer);

        if let Err(rejected) = device.submit(token, data) {
            self.shared.pool.lock().reclaim(rejected.token, rejected.buffer);
            return Err(self.drop_chunk("output device refused the buffer"));
        }

        self.shared.stats.record_delivery(chunk.len());
        Ok(())
    }

    /// Flush the device, wait for its buffers, and close it. Idempotent.
    pub fn dispose(&self) {
        let Some(device) = self.device.write().take() else {
            return;
        };

        if let Err(e) = device.reset() {
            log::error!("Failed to reset output device {}: {}", self.device_index, e);
        }
        if self.events.send(StreamEvent::Shutdown).is_err() {
            log::warn!("Playback dispatcher already gone");
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            join_dispatcher(handle, "Playback");
        }

        let forced = self.shared.pool.lock().release_all();
        if forced > 0 {
            log::warn!("Forced {} playback buffers back into the pool", forced);
        }
        device.close();
        log::info!("Playback disposed on device {}", self.device_index);
    }

    pub fn is_disposed(&self) -> bool {
        self.device.read().is_none()
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.shared.pool.lock().counts()
    }

    fn drop_chunk(&self, reason: &str) -> DeliveryFault {
        let drops = self.shared.stats.record_drop();
        if should_log(drops) {
            log::warn!("Dropped playback chunk: {} ({} drops so far)", reason, drops);
        }
        DeliveryFault::TransientDrop
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn run_dispatcher(shared: Arc<PlaybackShared>, events: CompletionReceiver) {
    for event in events.iter() {
        match event {
            StreamEvent::Completed(completion) => shared.handle_completion(completion),
            StreamEvent::Shutdown => break,
        }
    }
}

impl PlaybackShared {
    fn handle_completion(&self, completion: Completion) {
        let Completion {
            token,
            buffer,
            bytes,
        } = completion;

        let mut pool = self.pool.lock();
        match pool.complete(token, buffer, bytes) {
            Ok(()) => {
                pool.release_filled(token);
                drop(pool);
                self.stats.record_reclaimed();
            }
            Err(StaleToken(token)) => {
                drop(pool);
                let stale = self.stats.record_stale();
                if should_log(stale) {
                    log::debug!("Ignoring stale playback completion {:?}", token);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::virtual_device::{ClockMode, VirtualBackend};
    use crate::engine::wait_for;

    fn backend() -> VirtualBackend {
        VirtualBackend::new(ClockMode::Manual).with_output("Speakers")
    }

    fn open(backend: &VirtualBackend, config: &LoopbackConfig) -> PlaybackEngine {
        PlaybackEngine::open(backend, 0, config, Arc::new(DeliveryStats::new())).unwrap()
    }

    fn chunk(samples: &[i16]) -> AudioChunk {
        AudioChunk::from_samples(samples, AudioFormat::default()).unwrap()
    }

    #[test]
    fn plays_chunks_in_order_and_reclaims_buffers() {
        let backend = backend();
        let engine = open(&backend, &LoopbackConfig::default());

        engine.play(chunk(&[1, 2, 3])).unwrap();
        engine.play(chunk(&[4, 5])).unwrap();
        assert_eq!(backend.queued(Direction::Output, 0), 2);

        assert_eq!(backend.complete_output(0, 2), 2);
        wait_for(|| engine.stats().buffers_reclaimed == 2);
        assert_eq!(backend.played_samples(0), vec![1, 2, 3, 4, 5]);
        assert_eq!(engine.pool_counts().free, 2);
        assert_eq!(engine.stats().chunks_delivered, 2);
    }

    #[test]
    fn drops_when_every_buffer_is_in_flight() {
        let backend = backend();
        let config = LoopbackConfig {
            max_playback_buffers: 2,
            ..LoopbackConfig::default()
        };
        let engine = open(&backend, &config);

        engine.play(chunk(&[1])).unwrap();
        engine.play(chunk(&[2])).unwrap();
        assert_eq!(engine.play(chunk(&[3])), Err(DeliveryFault::TransientDrop));
        assert_eq!(engine.stats().transient_drops, 1);

        backend.complete_output(0, 1);
        wait_for(|| engine.pool_counts().free == 1);
        engine.play(chunk(&[4])).unwrap();
        assert_eq!(engine.pool_counts().queued, 2);
    }

    #[test]
    fn rejects_chunks_in_another_format() {
        let backend = backend();
        let engine = open(&backend, &LoopbackConfig::default());
        let stereo = AudioChunk::from_samples(&[1, 1], AudioFormat::stereo(44_100)).unwrap();

        assert!(matches!(
            engine.play(stereo),
            Err(DeliveryFault::CallbackFault(_))
        ));
        assert_eq!(backend.queued(Direction::Output, 0), 0);
    }

    #[test]
    fn empty_chunk_is_accepted_without_a_buffer() {
        let backend = backend();
        let engine = open(&backend, &LoopbackConfig::default());
        engine.play(chunk(&[])).unwrap();
        assert_eq!(engine.pool_counts(), PoolCounts::default());
    }

    #[test]
    fn refused_submit_reclaims_the_buffer() {
        let backend = backend();
        let engine = open(&backend, &LoopbackConfig::default());
        backend.set_reject_submits(Direction::Output, 0, true);

        assert_eq!(engine.play(chunk(&[9])), Err(DeliveryFault::TransientDrop));
        assert_eq!(engine.pool_counts().free, 1);
        assert_eq!(engine.pool_counts().queued, 0);
    }

    #[test]
    fn dispose_drains_closes_and_is_idempotent() {
        let backend = backend();
        let engine = open(&backend, &LoopbackConfig::default());
        engine.play(chunk(&[1, 2])).unwrap();
        engine.play(chunk(&[3, 4])).unwrap();

        engine.dispose();
        engine.dispose();

        assert!(engine.is_disposed());
        assert!(!backend.is_open(Direction::Output, 0));
        assert_eq!(backend.close_count(Direction::Output, 0), 1);
        assert_eq!(engine.pool_counts().free, 2);
        assert!(backend.played_samples(0).is_empty());
        assert_eq!(engine.play(chunk(&[5])), Err(DeliveryFault::TransientDrop));
    }

    #[test]
    fn concurrent_players_never_exceed_the_buffer_limit() {
        let backend = backend();
        let config = LoopbackConfig {
            max_playback_buffers: 4,
            ..LoopbackConfig::default()
        };
        let engine = open(&backend, &config);

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        let _ = engine.play(chunk(&[1, 2]));
                    }
                });
            }
        });

        let counts = engine.pool_counts();
        assert!(counts.queued <= 4);
        let stats = engine.stats();
        assert_eq!(stats.chunks_delivered + stats.transient_drops, 40);
    }

    #[test]
    fn dropping_the_engine_closes_the_device() {
        let backend = backend();
        let engine = open(&backend, &LoopbackConfig::default());
        drop(engine);
        assert!(!backend.is_open(Direction::Output, 0));
    }
}
