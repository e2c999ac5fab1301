//! Software audio endpoints.
//!
//! `VirtualBackend` implements [`AudioBackend`] without hardware. Inputs
//! synthesize a [`Signal`]; outputs record what they were given. Completions
//! are produced either by a clock thread per stream or on demand through
//! [`VirtualBackend::complete_input`] / [`VirtualBackend::complete_output`],
//! which lets tests decide exactly when and from which thread the device
//! "finishes" a buffer.

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::models::device::{DeviceInfo, Direction};
use crate::models::error::LoopbackError;
use crate::models::format::{AudioFormat, BYTES_PER_SAMPLE};
use crate::traits::backend::{
    AudioBackend, BufferToken, Completion, CompletionSender, DeviceStream, StreamEvent, SubmitError,
};

/// Played bytes kept per output endpoint.
const PLAYED_LOG_LIMIT: usize = 4 * 1024 * 1024;

/// How completions are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    /// Only when a test calls `complete_input` / `complete_output`.
    Manual,
    /// One buffer per `period` on a background thread.
    Clocked { period: Duration },
}

/// What a virtual input records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Silence,
    Constant(i16),
    /// Sine wave, continuous in phase across buffers.
    Tone {
        frequency_hz: f32,
        amplitude: i16,
    },
}

impl Signal {
    fn sample(&self, frame: u64, sample_rate_hz: u32) -> i16 {
        match *self {
            Signal::Silence => 0,
            Signal::Constant(value) => value,
            Signal::Tone {
                frequency_hz,
                amplitude,
            } => {
                let cycles = (frame as f64 * frequency_hz as f64 / sample_rate_hz as f64).fract();
                let value = amplitude as f32 * (TAU * cycles as f32).sin();
                value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
            }
        }
    }
}

struct Endpoint {
    name: String,
    signal: Signal,
    formats: Mutex<Option<Vec<AudioFormat>>>,
    stream: Mutex<Option<Arc<StreamCore>>>,
    reject_submits: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    played: Mutex<VecDeque<u8>>,
}

impl Endpoint {
    fn new(name: &str, signal: Signal) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            signal,
            formats: Mutex::new(None),
            stream: Mutex::new(None),
            reject_submits: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            played: Mutex::new(VecDeque::new()),
        })
    }

    fn supports(&self, format: AudioFormat) -> bool {
        self.formats
            .lock()
            .as_ref()
            .map_or(true, |formats| formats.contains(&format))
    }

    fn current(&self) -> Option<Arc<StreamCore>> {
        self.stream.lock().clone()
    }

    fn record_played(&self, bytes: &[u8]) {
        let mut played = self.played.lock();
        played.extend(bytes);
        let excess = played.len().saturating_sub(PLAYED_LOG_LIMIT);
        played.drain(..excess);
    }
}

#[derive(Default)]
struct StreamQueue {
    buffers: VecDeque<(BufferToken, Vec<u8>)>,
    frames: u64,
}

struct StreamCore {
    direction: Direction,
    format: AudioFormat,
    endpoint: Arc<Endpoint>,
    events: CompletionSender,
    queue: Mutex<StreamQueue>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl StreamCore {
    /// Finish the oldest queued buffer. Inputs only complete once started.
    fn complete_next(&self) -> bool {
        let mut queue = self.queue.lock();
        if self.direction == Direction::Input && !self.started.load(Ordering::Acquire) {
            return false;
        }
        let Some((token, mut buffer)) = queue.buffers.pop_front() else {
            return false;
        };

        let bytes = match self.direction {
            Direction::Input => {
                let frames = self.synthesize(&mut buffer, queue.frames);
                queue.frames += frames as u64;
                frames * self.format.block_align()
            }
            Direction::Output => {
                self.endpoint.record_played(&buffer);
                buffer.len()
            }
        };

        // Sent under the queue lock so a concurrent reset sees it as done.
        let _ = self.events.send(StreamEvent::Completed(Completion {
            token,
            buffer,
            bytes,
        }));
        true
    }

    fn synthesize(&self, buffer: &mut [u8], first_frame: u64) -> usize {
        let block_align = self.format.block_align();
        let channels = self.format.channels as usize;
        let mut frames = 0;
        for (i, frame) in buffer.chunks_exact_mut(block_align).enumerate() {
            let value = self
                .endpoint
                .signal
                .sample(first_frame + i as u64, self.format.sample_rate_hz);
            for channel in 0..channels {
                let at = channel * BYTES_PER_SAMPLE;
                frame[at..at + BYTES_PER_SAMPLE].copy_from_slice(&value.to_le_bytes());
            }
            frames += 1;
        }
        frames
    }

    fn flush(&self) {
        let mut queue = self.queue.lock();
        self.started.store(false, Ordering::Release);
        for (token, buffer) in queue.buffers.drain(..) {
            let _ = self.events.send(StreamEvent::Completed(Completion {
                token,
                buffer,
                bytes: 0,
            }));
        }
    }
}

struct Clock {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

struct VirtualStream {
    core: Arc<StreamCore>,
    clock: Mutex<Option<Clock>>,
}

impl VirtualStream {
    fn stop_clock(&self) {
        if let Some(clock) = self.clock.lock().take() {
            drop(clock.stop);
            if clock.handle.join().is_err() {
                log::error!("Virtual device clock for {} panicked", self.core.endpoint.name);
            }
        }
    }
}

impl DeviceStream for VirtualStream {
    fn format(&self) -> AudioFormat {
        self.core.format
    }

    fn submit(&self, token: BufferToken, buffer: Vec<u8>) -> Result<(), SubmitError> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(SubmitError {
                error: LoopbackError::DeviceUnavailable,
                token,
                buffer,
            });
        }
        if self.core.endpoint.reject_submits.load(Ordering::Acquire) {
            return Err(SubmitError {
                error: LoopbackError::Backend(format!(
                    "{} is refusing buffers",
                    self.core.endpoint.name
                )),
                token,
                buffer,
            });
        }
        self.core.queue.lock().buffers.push_back((token, buffer));
        Ok(())
    }

    fn start(&self) -> Result<(), LoopbackError> {
        self.core.started.store(true, Ordering::Release);
        Ok(())
    }

    fn reset(&self) -> Result<(), LoopbackError> {
        self.core.flush();
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), LoopbackError> {
        self.stop_clock();
        self.core.closed.store(true, Ordering::Release);
        self.core.queue.lock().buffers.clear();
        let endpoint = &self.core.endpoint;
        endpoint.stream.lock().take();
        endpoint.closes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.stop_clock();
    }
}

fn spawn_clock(core: Arc<StreamCore>, period: Duration) -> Result<Clock, LoopbackError> {
    let (stop, stopped) = channel::bounded::<()>(0);
    let name = format!("virtual-{}", core.endpoint.name);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || loop {
            match stopped.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => {
                    core.complete_next();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })
        .map_err(|e| LoopbackError::Backend(format!("failed to spawn device clock: {}", e)))?;
    Ok(Clock { stop, handle })
}

/// A set of software endpoints sharing one [`ClockMode`].
pub struct VirtualBackend {
    clock: ClockMode,
    inputs: Vec<Arc<Endpoint>>,
    outputs: Vec<Arc<Endpoint>>,
}

impl VirtualBackend {
    pub fn new(clock: ClockMode) -> Self {
        Self {
            clock,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, name: &str, signal: Signal) -> Self {
        self.inputs.push(Endpoint::new(name, signal));
        self
    }

    pub fn with_output(mut self, name: &str) -> Self {
        self.outputs.push(Endpoint::new(name, Signal::Silence));
        self
    }

    /// Make an endpoint refuse every format except `formats`.
    pub fn restrict_formats(&self, direction: Direction, index: usize, formats: &[AudioFormat]) {
        if let Some(endpoint) = self.endpoint(direction, index) {
            *endpoint.formats.lock() = Some(formats.to_vec());
        }
    }

    /// Make an endpoint refuse (or accept again) submitted buffers.
    pub fn set_reject_submits(&self, direction: Direction, index: usize, reject: bool) {
        if let Some(endpoint) = self.endpoint(direction, index) {
            endpoint.reject_submits.store(reject, Ordering::Release);
        }
    }

    /// Complete up to `count` buffers on input `index`. Returns how many.
    pub fn complete_input(&self, index: usize, count: usize) -> usize {
        self.complete(Direction::Input, index, count)
    }

    /// Complete up to `count` buffers on output `index`. Returns how many.
    pub fn complete_output(&self, index: usize, count: usize) -> usize {
        self.complete(Direction::Output, index, count)
    }

    pub fn queued(&self, direction: Direction, index: usize) -> usize {
        self.stream(direction, index)
            .map_or(0, |core| core.queue.lock().buffers.len())
    }

    pub fn is_open(&self, direction: Direction, index: usize) -> bool {
        self.stream(direction, index).is_some()
    }

    pub fn open_count(&self, direction: Direction, index: usize) -> usize {
        self.endpoint(direction, index)
            .map_or(0, |e| e.opens.load(Ordering::Acquire))
    }

    pub fn close_count(&self, direction: Direction, index: usize) -> usize {
        self.endpoint(direction, index)
            .map_or(0, |e| e.closes.load(Ordering::Acquire))
    }

    /// Bytes output `index` has played, oldest first.
    pub fn played_bytes(&self, index: usize) -> Vec<u8> {
        self.endpoint(Direction::Output, index)
            .map_or_else(Vec::new, |e| e.played.lock().iter().copied().collect())
    }

    /// Samples output `index` has played, decoded from little-endian PCM.
    pub fn played_samples(&self, index: usize) -> Vec<i16> {
        self.played_bytes(index)
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    fn complete(&self, direction: Direction, index: usize, count: usize) -> usize {
        let Some(core) = self.stream(direction, index) else {
            return 0;
        };
        (0..count).take_while(|_| core.complete_next()).count()
    }

    fn endpoint(&self, direction: Direction, index: usize) -> Option<&Arc<Endpoint>> {
        match direction {
            Direction::Input => self.inputs.get(index),
            Direction::Output => self.outputs.get(index),
        }
    }

    fn stream(&self, direction: Direction, index: usize) -> Option<Arc<StreamCore>> {
        self.endpoint(direction, index)?.current()
    }
}

impl AudioBackend for VirtualBackend {
    fn list_devices(&self, direction: Direction) -> Result<Vec<DeviceInfo>, LoopbackError> {
        let endpoints = match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        };
        Ok(endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| DeviceInfo {
                index,
                name: endpoint.name.clone(),
                direction,
            })
            .collect())
    }

    fn open(
        &self,
        direction: Direction,
        index: usize,
        format: AudioFormat,
        events: CompletionSender,
    ) -> Result<Box<dyn DeviceStream>, LoopbackError> {
        let endpoint = self
            .endpoint(direction, index)
            .ok_or(LoopbackError::DeviceUnavailable)?;
        if !endpoint.supports(format) {
            return Err(LoopbackError::FormatUnsupported);
        }

        let mut current = endpoint.stream.lock();
        if current.is_some() {
            return Err(LoopbackError::DeviceUnavailable);
        }
        let core = Arc::new(StreamCore {
            direction,
            format,
            endpoint: Arc::clone(endpoint),
            events,
            queue: Mutex::new(StreamQueue::default()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let clock = match self.clock {
            ClockMode::Manual => None,
            ClockMode::Clocked { period } => Some(spawn_clock(Arc::clone(&core), period)?),
        };
        *current = Some(Arc::clone(&core));
        endpoint.opens.fetch_add(1, Ordering::AcqRel);

        Ok(Box::new(VirtualStream {
            core,
            clock: Mutex::new(clock),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual() -> VirtualBackend {
        VirtualBackend::new(ClockMode::Manual)
            .with_input("Line In", Signal::Constant(1000))
            .with_output("Speakers")
    }

    fn drain(receiver: &channel::Receiver<StreamEvent>) -> Vec<Completion> {
        receiver
            .try_iter()
            .filter_map(|event| match event {
                StreamEvent::Completed(c) => Some(c),
                StreamEvent::Shutdown => None,
            })
            .collect()
    }

    #[test]
    fn lists_endpoints_in_index_order() {
        let backend = manual().with_input("USB Mic", Signal::Silence);
        let inputs = backend.list_devices(Direction::Input).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1].index, 1);
        assert_eq!(inputs[1].name, "USB Mic");
        assert_eq!(inputs[1].direction, Direction::Input);
    }

    #[test]
    fn open_rejects_unknown_busy_and_unsupported() {
        let backend = manual();
        let (tx, _rx) = channel::unbounded();
        let format = AudioFormat::default();

        assert_eq!(
            backend.open(Direction::Output, 7, format, tx.clone()).err(),
            Some(LoopbackError::DeviceUnavailable)
        );

        let stream = backend.open(Direction::Output, 0, format, tx.clone()).unwrap();
        assert_eq!(
            backend.open(Direction::Output, 0, format, tx.clone()).err(),
            Some(LoopbackError::DeviceUnavailable)
        );
        stream.close().unwrap();

        backend.restrict_formats(Direction::Input, 0, &[AudioFormat::stereo(48_000)]);
        assert_eq!(
            backend.open(Direction::Input, 0, format, tx).err(),
            Some(LoopbackError::FormatUnsupported)
        );
    }

    #[test]
    fn input_completes_only_after_start() {
        let backend = manual();
        let (tx, rx) = channel::unbounded();
        let stream = backend
            .open(Direction::Input, 0, AudioFormat::default(), tx)
            .unwrap();
        stream.submit(BufferToken::new(0, 1), vec![0; 8]).unwrap();

        assert_eq!(backend.complete_input(0, 1), 0);
        stream.start().unwrap();
        assert_eq!(backend.complete_input(0, 1), 1);

        let done = drain(&rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].bytes, 8);
        assert_eq!(&done[0].buffer[..2], &1000i16.to_le_bytes());
        stream.close().unwrap();
    }

    #[test]
    fn tone_is_phase_continuous_across_buffers() {
        let backend = VirtualBackend::new(ClockMode::Manual).with_input(
            "Tone",
            Signal::Tone {
                frequency_hz: 1000.0,
                amplitude: i16::MAX,
            },
        );
        let (tx, rx) = channel::unbounded();
        let format = AudioFormat::mono(44_100);
        let stream = backend.open(Direction::Input, 0, format, tx).unwrap();
        stream.start().unwrap();
        stream.submit(BufferToken::new(0, 1), vec![0; 20]).unwrap();
        stream.submit(BufferToken::new(1, 1), vec![0; 20]).unwrap();
        backend.complete_input(0, 2);

        let samples: Vec<i16> = drain(&rx)
            .iter()
            .flat_map(|c| {
                c.buffer
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect::<Vec<_>>()
            })
            .collect();
        let tone = Signal::Tone {
            frequency_hz: 1000.0,
            amplitude: i16::MAX,
        };
        let expected: Vec<i16> = (0..20u64).map(|n| tone.sample(n, 44_100)).collect();
        assert_eq!(samples, expected);
        stream.close().unwrap();
    }

    #[test]
    fn reset_returns_every_queued_buffer_empty() {
        let backend = manual();
        let (tx, rx) = channel::unbounded();
        let stream = backend
            .open(Direction::Input, 0, AudioFormat::default(), tx)
            .unwrap();
        stream.start().unwrap();
        for slot in 0..3 {
            stream.submit(BufferToken::new(slot, 1), vec![0; 4]).unwrap();
        }

        stream.reset().unwrap();
        let done = drain(&rx);
        assert_eq!(done.len(), 3);
        assert!(done.iter().all(|c| c.bytes == 0));
        assert_eq!(backend.queued(Direction::Input, 0), 0);
        // Reset also halts capture.
        stream.submit(BufferToken::new(0, 2), vec![0; 4]).unwrap();
        assert_eq!(backend.complete_input(0, 1), 0);
        stream.close().unwrap();
    }

    #[test]
    fn output_records_played_bytes() {
        let backend = manual();
        let (tx, rx) = channel::unbounded();
        let stream = backend
            .open(Direction::Output, 0, AudioFormat::default(), tx)
            .unwrap();
        stream.submit(BufferToken::new(0, 1), vec![1, 0, 2, 0]).unwrap();
        assert_eq!(backend.complete_output(0, 5), 1);
        assert_eq!(backend.played_samples(0), vec![1, 2]);
        assert_eq!(drain(&rx)[0].bytes, 4);
        stream.close().unwrap();
    }

    #[test]
    fn refused_submit_hands_the_buffer_back() {
        let backend = manual();
        let (tx, _rx) = channel::unbounded();
        let stream = backend
            .open(Direction::Output, 0, AudioFormat::default(), tx)
            .unwrap();
        backend.set_reject_submits(Direction::Output, 0, true);

        let rejected = stream.submit(BufferToken::new(3, 9), vec![5; 6]).unwrap_err();
        assert_eq!(rejected.token, BufferToken::new(3, 9));
        assert_eq!(rejected.buffer, vec![5; 6]);
        stream.close().unwrap();
    }

    #[test]
    fn close_frees_the_endpoint() {
        let backend = manual();
        let (tx, _rx) = channel::unbounded();
        let stream = backend
            .open(Direction::Output, 0, AudioFormat::default(), tx.clone())
            .unwrap();
        assert!(backend.is_open(Direction::Output, 0));
        stream.close().unwrap();
        assert!(!backend.is_open(Direction::Output, 0));
        assert_eq!(backend.close_count(Direction::Output, 0), 1);

        let again = backend
            .open(Direction::Output, 0, AudioFormat::default(), tx)
            .unwrap();
        assert_eq!(backend.open_count(Direction::Output, 0), 2);
        again.close().unwrap();
    }

    #[test]
    fn clocked_input_completes_on_its_own() {
        let backend = VirtualBackend::new(ClockMode::Clocked {
            period: Duration::from_millis(1),
        })
        .with_input("Line In", Signal::Constant(7));
        let (tx, rx) = channel::unbounded();
        let stream = backend
            .open(Direction::Input, 0, AudioFormat::default(), tx)
            .unwrap();
        stream.submit(BufferToken::new(0, 1), vec![0; 4]).unwrap();
        stream.start().unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(event, StreamEvent::Completed(c) if c.bytes == 4));
        stream.close().unwrap();
    }
}
