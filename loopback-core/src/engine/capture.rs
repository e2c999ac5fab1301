//! Capture engine.
//!
//! Keeps every pool buffer queued at the input device and turns each
//! completion into an owned [`AudioChunk`] for the registered callback.
//!
//! ```text
//! [Device] ─completion─→ [dispatcher] ─copy─→ AudioChunk ─→ callback
//!     ↑                        │
//!     └──────── resubmit ──────┘  (always, whatever the callback did)
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError};
use parking_lot::Mutex;

use super::{join_dispatcher, panic_message};
use crate::device::handle::DeviceHandle;
use crate::models::chunk::AudioChunk;
use crate::models::config::LoopbackConfig;
use crate::models::device::Direction;
use crate::models::error::{DeliveryFault, LoopbackError};
use crate::models::format::AudioFormat;
use crate::models::state::EngineState;
use crate::models::stats::{should_log, DeliveryStats, DeliveryStatsSnapshot};
use crate::processing::buffer_pool::{BufferPool, PoolCounts, StaleToken};
use crate::traits::backend::{
    AudioBackend, BufferToken, Completion, CompletionReceiver, CompletionSender, StreamEvent,
};
use crate::traits::chunk_sink::ChunkCallback;

/// How long the dispatcher waits for a completion before retrying buffers
/// the device refused.
const REFILL_RETRY: Duration = Duration::from_millis(20);

/// State shared with the dispatcher thread.
struct CaptureShared {
    device: DeviceHandle,
    format: AudioFormat,
    pool: Mutex<BufferPool>,
    /// Held for the whole of each delivery, so taking it in `stop` waits out
    /// a callback in flight.
    state: Mutex<EngineState>,
    on_chunk: ChunkCallback,
    stats: Arc<DeliveryStats>,
    suspended: AtomicBool,
    max_consecutive_faults: u32,
}

/// Continuous capture from one input device.
pub struct CaptureEngine {
    shared: Arc<CaptureShared>,
    events: CompletionSender,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CaptureEngine {
    /// Open the input device, allocate the pool and queue every buffer.
    ///
    /// Fails without leaving the device open.
    pub fn open(
        backend: &dyn AudioBackend,
        device_index: usize,
        config: &LoopbackConfig,
        on_chunk: ChunkCallback,
        stats: Arc<DeliveryStats>,
    ) -> Result<Self, LoopbackError> {
        config.validate()?;

        let (events, receiver) = channel::unbounded();
        let device = DeviceHandle::open(
            backend,
            Direction::Input,
            device_index,
            config.format,
            events.clone(),
        )?;

        let mut pool =
            BufferPool::with_buffers(config.capture_buffer_count, config.capture_buffer_bytes());
        while let Some(buffer) = pool.acquire() {
            let (token, data) = pool.submit(buffer);
            if let Err(rejected) = device.submit(token, data) {
                log::error!(
                    "Input device {} refused its initial buffers: {}",
                    device_index,
                    rejected.error
                );
                return Err(rejected.error);
            }
        }

        let shared = Arc::new(CaptureShared {
            device,
            format: config.format,
            pool: Mutex::new(pool),
            state: Mutex::new(EngineState::Opened),
            on_chunk,
            stats,
            suspended: AtomicBool::new(false),
            max_consecutive_faults: config.max_consecutive_faults,
        });

        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("loopback-capture".into())
                .spawn(move || run_dispatcher(shared, receiver))
                .map_err(|e| {
                    LoopbackError::Backend(format!("failed to spawn capture dispatcher: {}", e))
                })?
        };

        log::info!(
            "Capture primed on device {} with {} × {} byte buffers",
            device_index,
            config.capture_buffer_count,
            config.capture_buffer_bytes()
        );

        Ok(Self {
            shared,
            events,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Opened → Running. A no-op when already running.
    pub fn start(&self) -> Result<(), LoopbackError> {
        let mut state = self.shared.state.lock();
        match *state {
            EngineState::Running => return Ok(()),
            EngineState::Stopping | EngineState::Stopped => {
                return Err(LoopbackError::EngineStopped)
            }
            EngineState::Opened => {}
        }
        self.shared.suspended.store(false, Ordering::Release);
        self.shared.device.start()?;
        *state = EngineState::Running;
        log::info!("Capture started on device {}", self.shared.device.index());
        Ok(())
    }

    /// Halt the device and drain every buffer back into the pool.
    ///
    /// No chunk callback runs after this returns. Idempotent. Must not be
    /// called from inside the chunk callback.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.is_stopped() {
                return;
            }
            *state = EngineState::Stopping;
        }

        if let Err(e) = self.shared.device.reset() {
            log::error!("Failed to reset input device: {}", e);
        }
        if self.events.send(StreamEvent::Shutdown).is_err() {
            log::warn!("Capture dispatcher already gone");
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            join_dispatcher(handle, "Capture");
        }

        let outstanding = self.shared.pool.lock().outstanding();
        if outstanding > 0 {
            log::warn!(
                "{} capture buffers still held by the device after reset",
                outstanding
            );
        }
        *self.shared.state.lock() = EngineState::Stopped;
        log::info!("Capture stopped on device {}", self.shared.device.index());
    }

    /// Stop and release the device.
    pub fn close(self) {
        self.stop();
        // The device closes when the last reference to the shared state
        // goes, which is here now that the dispatcher has been joined.
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }

    pub fn device_index(&self) -> usize {
        self.shared.device.index()
    }

    /// True once the consumer has failed too many times in a row.
    pub fn is_delivery_suspended(&self) -> bool {
        self.shared.suspended.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn pool_counts(&self) -> PoolCounts {
        self.shared.pool.lock().counts()
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_dispatcher(shared: Arc<CaptureShared>, events: CompletionReceiver) {
    loop {
        match events.recv_timeout(REFILL_RETRY) {
            Ok(StreamEvent::Completed(completion)) => shared.handle_completion(completion),
            Ok(StreamEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            // With every buffer refused, no completion will ever arrive to
            // trigger a refill, so retry on the timeout instead.
            Err(RecvTimeoutError::Timeout) => shared.retry_refused_buffers(),
        }
    }
}

impl CaptureShared {
    fn handle_completion(&self, completion: Completion) {
        let Completion {
            token,
            buffer,
            bytes,
        } = completion;

        let state = self.state.lock();
        let chunk = {
            let mut pool = self.pool.lock();
            if let Err(StaleToken(token)) = pool.complete(token, buffer, bytes) {
                let stale = self.stats.record_stale();
                if should_log(stale) {
                    log::debug!("Ignoring stale capture completion {:?}", token);
                }
                return;
            }
            if !state.recycles_buffers() {
                pool.release_filled(token);
                return;
            }
            match pool.filled(token) {
                Some(recorded) if state.is_running() && !recorded.is_empty() => {
                    Some(AudioChunk::copy_from(recorded, self.format))
                }
                _ => None,
            }
        };

        if let Some(chunk) = chunk.filter(|c| !c.is_empty()) {
            self.deliver(chunk);
        }
        self.resubmit(token);
        drop(state);
    }

    fn deliver(&self, chunk: AudioChunk) {
        if self.suspended.load(Ordering::Acquire) {
            self.stats.record_drop();
            return;
        }

        let len = chunk.len();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.on_chunk)(chunk)));
        let fault = match outcome {
            Ok(Ok(())) => {
                self.stats.record_delivery(len);
                return;
            }
            Ok(Err(DeliveryFault::TransientDrop)) => {
                self.stats.record_drop();
                return;
            }
            Ok(Err(fault)) => fault,
            Err(payload) => DeliveryFault::CallbackFault(panic_message(payload.as_ref())),
        };

        let consecutive = self.stats.record_fault();
        if should_log(consecutive as u64) {
            log::warn!("Chunk consumer failed ({} in a row): {}", consecutive, fault);
        }
        if consecutive >= self.max_consecutive_faults
            && !self.suspended.swap(true, Ordering::AcqRel)
        {
            log::error!(
                "Suspending capture delivery after {} consecutive consumer faults",
                consecutive
            );
        }
    }

    /// Queue free buffers again while running. Holds the state lock so a
    /// concurrent `stop` sees every buffer it has to drain.
    fn retry_refused_buffers(&self) {
        let state = self.state.lock();
        if !state.is_running() || self.pool.lock().counts().free == 0 {
            return;
        }
        self.refill_free_buffers();
        drop(state);
    }

    /// Filled → Queued, then top up anything the device refused earlier.
    fn resubmit(&self, token: BufferToken) {
        let requeued = self.pool.lock().requeue(token);
        if let Some((token, data)) = requeued {
            if !self.submit_or_reclaim(token, data) {
                return;
            }
        }
        self.refill_free_buffers();
    }

    fn refill_free_buffers(&self) {
        loop {
            let next = {
                let mut pool = self.pool.lock();
                pool.acquire().map(|buffer| pool.submit(buffer))
            };
            let Some((token, data)) = next else {
                break;
            };
            if !self.submit_or_reclaim(token, data) {
                break;
            }
        }
    }

    fn submit_or_reclaim(&self, token: BufferToken, data: Vec<u8>) -> bool {
        let Err(rejected) = self.device.submit(token, data) else {
            return true;
        };
        let queued = {
            let mut pool = self.pool.lock();
            pool.reclaim(rejected.token, rejected.buffer);
            pool.counts().queued
        };
        let drops = self.stats.record_drop();
        if should_log(drops) {
            log::warn!(
                "Input device refused a buffer: {} ({} drops so far)",
                rejected.error,
                drops
            );
            if queued == 0 {
                log::error!("No capture buffers queued; retrying every {:?}", REFILL_RETRY);
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::backend::virtual_device::{ClockMode, Signal, VirtualBackend};
    use crate::engine::wait_for;

    fn backend() -> VirtualBackend {
        VirtualBackend::new(ClockMode::Manual).with_input("Line In", Signal::Constant(1000))
    }

    fn recorder() -> (ChunkCallback, Arc<Mutex<Vec<AudioChunk>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let callback: ChunkCallback =
            Arc::new(move |chunk: AudioChunk| -> Result<(), DeliveryFault> {
                sink.lock().push(chunk);
                Ok(())
            });
        (callback, received)
    }

    fn counting(result: Result<(), DeliveryFault>) -> (ChunkCallback, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: ChunkCallback =
            Arc::new(move |_: AudioChunk| -> Result<(), DeliveryFault> {
                counter.fetch_add(1, Ordering::SeqCst);
                result.clone()
            });
        (callback, calls)
    }

    fn open(
        backend: &VirtualBackend,
        config: &LoopbackConfig,
        callback: ChunkCallback,
    ) -> CaptureEngine {
        CaptureEngine::open(backend, 0, config, callback, Arc::new(DeliveryStats::new())).unwrap()
    }

    #[test]
    fn open_queues_every_buffer() {
        let backend = backend();
        let (callback, _) = recorder();
        let engine = open(&backend, &LoopbackConfig::default(), callback);

        assert_eq!(engine.state(), EngineState::Opened);
        assert_eq!(backend.queued(Direction::Input, 0), 4);
        assert_eq!(engine.pool_counts().queued, 4);
    }

    #[test]
    fn delivers_each_completion_and_keeps_buffers_queued() {
        let backend = backend();
        let (callback, received) = recorder();
        let engine = open(&backend, &LoopbackConfig::default(), callback);
        engine.start().unwrap();

        assert_eq!(backend.complete_input(0, 3), 3);
        wait_for(|| engine.stats().chunks_delivered == 3);
        wait_for(|| backend.queued(Direction::Input, 0) == 4);

        let chunks = received.lock();
        assert_eq!(chunks.len(), 3);
        for chunk in chunks.iter() {
            assert_eq!(chunk.len(), 1764);
            assert!(chunk.samples().all(|s| s == 1000));
        }
    }

    #[test]
    fn stop_returns_every_buffer_and_silences_the_callback() {
        let backend = backend();
        let (callback, calls) = counting(Ok(()));
        let engine = open(&backend, &LoopbackConfig::default(), callback);
        engine.start().unwrap();
        engine.stop();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.pool_counts().free, 4);
        assert_eq!(backend.queued(Direction::Input, 0), 0);
        assert_eq!(backend.complete_input(0, 4), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_is_idempotent_and_final() {
        let backend = backend();
        let (callback, _) = recorder();
        let engine = open(&backend, &LoopbackConfig::default(), callback);
        engine.start().unwrap();
        engine.stop();
        engine.stop();

        assert_eq!(engine.start(), Err(LoopbackError::EngineStopped));
    }

    #[test]
    fn start_twice_is_a_no_op() {
        let backend = backend();
        let (callback, _) = recorder();
        let engine = open(&backend, &LoopbackConfig::default(), callback);
        engine.start().unwrap();
        engine.start().unwrap();
        assert!(engine.state().is_running());
    }

    #[test]
    fn failing_consumer_does_not_starve_the_device() {
        let backend = backend();
        let (callback, calls) = counting(Err(DeliveryFault::CallbackFault("disk full".into())));
        let engine = open(&backend, &LoopbackConfig::default(), callback);
        engine.start().unwrap();

        for _ in 0..10 {
            wait_for(|| backend.queued(Direction::Input, 0) == 4);
            backend.complete_input(0, 1);
        }
        wait_for(|| engine.stats().callback_faults == 10);
        wait_for(|| backend.queued(Direction::Input, 0) == 4);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert!(!engine.is_delivery_suspended());
    }

    #[test]
    fn panicking_consumer_counts_as_a_fault() {
        let backend = backend();
        let callback: ChunkCallback = Arc::new(|_: AudioChunk| -> Result<(), DeliveryFault> {
            panic!("consumer bug")
        });
        let engine = open(&backend, &LoopbackConfig::default(), callback);
        engine.start().unwrap();

        backend.complete_input(0, 2);
        wait_for(|| engine.stats().callback_faults == 2);
        wait_for(|| backend.queued(Direction::Input, 0) == 4);
    }

    #[test]
    fn delivery_suspends_after_consecutive_faults() {
        let backend = backend();
        let config = LoopbackConfig {
            max_consecutive_faults: 3,
            ..LoopbackConfig::default()
        };
        let (callback, calls) = counting(Err(DeliveryFault::CallbackFault("broken".into())));
        let engine = open(&backend, &config, callback);
        engine.start().unwrap();

        for _ in 0..5 {
            wait_for(|| backend.queued(Direction::Input, 0) == 4);
            backend.complete_input(0, 1);
        }
        wait_for(|| engine.stats().transient_drops == 2);

        assert!(engine.is_delivery_suspended());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.stats().callback_faults, 3);
        wait_for(|| backend.queued(Direction::Input, 0) == 4);
    }

    #[test]
    fn transient_drop_from_consumer_is_not_a_fault() {
        let backend = backend();
        let config = LoopbackConfig {
            max_consecutive_faults: 1,
            ..LoopbackConfig::default()
        };
        let (callback, _) = counting(Err(DeliveryFault::TransientDrop));
        let engine = open(&backend, &config, callback);
        engine.start().unwrap();

        backend.complete_input(0, 3);
        wait_for(|| engine.stats().transient_drops == 3);
        assert_eq!(engine.stats().callback_faults, 0);
        assert!(!engine.is_delivery_suspended());
    }

    #[test]
    fn refused_buffers_are_reclaimed_and_requeued_later() {
        let backend = backend();
        let (callback, _) = recorder();
        let engine = open(&backend, &LoopbackConfig::default(), callback);
        engine.start().unwrap();

        backend.set_reject_submits(Direction::Input, 0, true);
        backend.complete_input(0, 1);
        wait_for(|| engine.pool_counts().free == 1);
        assert!(engine.stats().transient_drops >= 1);
        assert_eq!(backend.queued(Direction::Input, 0), 3);

        backend.set_reject_submits(Direction::Input, 0, false);
        backend.complete_input(0, 1);
        wait_for(|| backend.queued(Direction::Input, 0) == 4);
        assert_eq!(engine.pool_counts().free, 0);
    }

    #[test]
    fn capture_resumes_after_every_buffer_was_refused() {
        let backend = backend();
        let (callback, _) = recorder();
        let engine = open(&backend, &LoopbackConfig::default(), callback);
        engine.start().unwrap();

        backend.set_reject_submits(Direction::Input, 0, true);
        backend.complete_input(0, 4);
        wait_for(|| engine.pool_counts().free == 4);
        assert_eq!(backend.queued(Direction::Input, 0), 0);

        backend.set_reject_submits(Direction::Input, 0, false);
        wait_for(|| backend.queued(Direction::Input, 0) == 4);
        assert_eq!(engine.pool_counts().queued, 4);

        backend.complete_input(0, 2);
        wait_for(|| engine.stats().chunks_delivered == 2);
        assert!(engine.state().is_running());
    }

    #[test]
    fn open_failures_leave_no_device_open() {
        let backend = backend();
        let (callback, _) = recorder();
        let stats = Arc::new(DeliveryStats::new());
        let config = LoopbackConfig::default();

        let missing = CaptureEngine::open(
            &backend,
            3,
            &config,
            Arc::clone(&callback),
            Arc::clone(&stats),
        );
        assert_eq!(missing.err(), Some(LoopbackError::DeviceUnavailable));

        backend.set_reject_submits(Direction::Input, 0, true);
        let refused = CaptureEngine::open(&backend, 0, &config, callback, stats);
        assert!(matches!(refused.err(), Some(LoopbackError::Backend(_))));
        assert!(!backend.is_open(Direction::Input, 0));
        assert_eq!(backend.close_count(Direction::Input, 0), 1);
    }

    #[test]
    fn close_releases_the_device() {
        let backend = backend();
        let (callback, _) = recorder();
        let engine = open(&backend, &LoopbackConfig::default(), callback);
        engine.start().unwrap();
        engine.close();

        assert!(!backend.is_open(Direction::Input, 0));
        assert_eq!(backend.close_count(Direction::Input, 0), 1);
    }
}
