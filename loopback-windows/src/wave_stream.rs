//! WinMM waveIn / waveOut stream.
//!
//! Opened with `CALLBACK_EVENT`: the driver signals an auto-reset event
//! whenever a header completes, and a pump thread per stream turns every
//! header carrying `WHDR_DONE` into a [`Completion`]. No code runs inside
//! the driver's callback context.
//!
//! ```text
//! submit ─→ [prepare + AddBuffer/Write] ─→ driver
//!                                            │ SetEvent
//!                                   [pump] ←─┘
//!                                      │ unprepare
//!                                      └─→ CompletionSender
//! ```

use std::mem::{self, size_of};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use windows::core::{PCWSTR, PSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Media::Audio::*;
use windows::Win32::Media::{
    MMSYSERR_ALLOCATED, MMSYSERR_BADDEVICEID, MMSYSERR_NODRIVER, MMSYSERR_NOERROR,
};
use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject};

use loopback_core::models::device::Direction;
use loopback_core::models::error::LoopbackError;
use loopback_core::models::format::AudioFormat;
use loopback_core::traits::backend::{
    BufferToken, Completion, CompletionSender, DeviceStream, StreamEvent, SubmitError,
};

/// Upper bound on one pump wait, so a lost wakeup only delays a completion.
const PUMP_WAIT_MS: u32 = 100;

/// Map an MMRESULT onto the core error taxonomy.
pub(crate) fn check(code: u32, call: &str) -> Result<(), LoopbackError> {
    match code {
        MMSYSERR_NOERROR => Ok(()),
        MMSYSERR_BADDEVICEID | MMSYSERR_ALLOCATED | MMSYSERR_NODRIVER => {
            Err(LoopbackError::DeviceUnavailable)
        }
        WAVERR_BADFORMAT => Err(LoopbackError::FormatUnsupported),
        other => Err(LoopbackError::Backend(format!(
            "{} failed with MMRESULT {}",
            call, other
        ))),
    }
}

/// Run `stop` then `reset`, always reaching `reset`: it is what returns the
/// queued headers. A failed stop is logged and otherwise ignored.
fn stop_then_reset(
    stop: impl FnOnce() -> Result<(), LoopbackError>,
    reset: impl FnOnce() -> Result<(), LoopbackError>,
) -> Result<(), LoopbackError> {
    if let Err(e) = stop() {
        log::warn!("Stopping wave input before reset failed: {}", e);
    }
    reset()
}

/// Keep `lent` only if its header was unprepared. Otherwise the driver may
/// still own the header and its buffer, so both are leaked rather than freed.
fn keep_if_unprepared<T>(lent: T, unprepared: Result<(), LoopbackError>) -> Option<T> {
    match unprepared {
        Ok(()) => Some(lent),
        Err(e) => {
            log::error!("Leaking wave header the driver still holds: {}", e);
            mem::forget(lent);
            None
        }
    }
}

pub(crate) fn wave_format(format: AudioFormat) -> WAVEFORMATEX {
    WAVEFORMATEX {
        wFormatTag: WAVE_FORMAT_PCM as u16,
        nChannels: format.channels,
        nSamplesPerSec: format.sample_rate_hz,
        nAvgBytesPerSec: format.bytes_per_second() as u32,
        nBlockAlign: format.block_align() as u16,
        wBitsPerSample: format.bits_per_sample(),
        cbSize: 0,
    }
}

/// Owned Win32 event handle.
struct EventHandle(HANDLE);

impl EventHandle {
    fn new() -> Result<Self, LoopbackError> {
        let handle = unsafe { CreateEventW(None, false, false, PCWSTR::null()) }
            .map_err(|e| LoopbackError::Backend(format!("CreateEventW failed: {}", e)))?;
        Ok(Self(handle))
    }

    fn signal(&self) {
        if let Err(e) = unsafe { SetEvent(self.0) } {
            log::error!("SetEvent failed: {}", e);
        }
    }
}

impl Drop for EventHandle {
    fn drop(&mut self) {
        if let Err(e) = unsafe { CloseHandle(self.0) } {
            log::error!("CloseHandle on stream event failed: {}", e);
        }
    }
}

/// `WAVEHDR` is `packed(1)`; boxing it at 8-byte alignment keeps the fields
/// the driver writes (`dwFlags`, `dwBytesRecorded`) naturally aligned, so
/// they can be read with volatile loads.
#[repr(C, align(8))]
struct AlignedHeader(WAVEHDR);

/// A buffer lent to the driver, with the header describing it.
struct InFlight {
    token: BufferToken,
    header: Box<AlignedHeader>,
    buffer: Vec<u8>,
}

impl InFlight {
    fn header_ptr(&mut self) -> *mut WAVEHDR {
        &mut self.header.0
    }

    fn is_done(&self) -> bool {
        // SAFETY: the header lives in a Box at a fixed address for as long as
        // the driver holds it; `dwFlags` sits at a 4-byte aligned offset.
        let flags = unsafe { ptr::read_volatile(ptr::addr_of!(self.header.0.dwFlags)) };
        flags & WHDR_DONE != 0
    }

    fn bytes_recorded(&self) -> usize {
        // SAFETY: as in `is_done`.
        unsafe { ptr::read_volatile(ptr::addr_of!(self.header.0.dwBytesRecorded)) as usize }
    }
}

#[derive(Clone, Copy)]
enum WaveHandle {
    In(HWAVEIN),
    Out(HWAVEOUT),
}

impl WaveHandle {
    fn open(
        direction: Direction,
        index: u32,
        format: &WAVEFORMATEX,
        event: &EventHandle,
    ) -> Result<Self, LoopbackError> {
        let callback = Some(event.0 .0 as usize);
        match direction {
            Direction::Input => {
                let mut handle = HWAVEIN::default();
                let rc = unsafe {
                    waveInOpen(
                        Some(ptr::addr_of_mut!(handle)),
                        index,
                        format,
                        callback,
                        None,
                        CALLBACK_EVENT,
                    )
                };
                check(rc, "waveInOpen")?;
                Ok(Self::In(handle))
            }
            Direction::Output => {
                let mut handle = HWAVEOUT::default();
                let rc = unsafe {
                    waveOutOpen(
                        Some(ptr::addr_of_mut!(handle)),
                        index,
                        format,
                        callback,
                        None,
                        CALLBACK_EVENT,
                    )
                };
                check(rc, "waveOutOpen")?;
                Ok(Self::Out(handle))
            }
        }
    }

    fn direction(&self) -> Direction {
        match self {
            Self::In(_) => Direction::Input,
            Self::Out(_) => Direction::Output,
        }
    }

    /// Prepare `header` and hand it to the driver.
    unsafe fn queue(&self, header: *mut WAVEHDR) -> Result<(), LoopbackError> {
        let size = size_of::<WAVEHDR>() as u32;
        match *self {
            Self::In(h) => unsafe {
                check(waveInPrepareHeader(h, header, size), "waveInPrepareHeader")?;
                if let Err(e) = check(waveInAddBuffer(h, header, size), "waveInAddBuffer") {
                    waveInUnprepareHeader(h, header, size);
                    return Err(e);
                }
            },
            Self::Out(h) => unsafe {
                check(waveOutPrepareHeader(h, header, size), "waveOutPrepareHeader")?;
                if let Err(e) = check(waveOutWrite(h, header, size), "waveOutWrite") {
                    waveOutUnprepareHeader(h, header, size);
                    return Err(e);
                }
            },
        }
        Ok(())
    }

    unsafe fn unprepare(&self, header: *mut WAVEHDR) -> Result<(), LoopbackError> {
        let size = size_of::<WAVEHDR>() as u32;
        match *self {
            Self::In(h) => unsafe {
                check(waveInUnprepareHeader(h, header, size), "waveInUnprepareHeader")
            },
            Self::Out(h) => unsafe {
                check(waveOutUnprepareHeader(h, header, size), "waveOutUnprepareHeader")
            },
        }
    }

    fn start(&self) -> Result<(), LoopbackError> {
        match *self {
            Self::In(h) => check(unsafe { waveInStart(h) }, "waveInStart"),
            Self::Out(_) => Ok(()),
        }
    }

    /// Halt and mark every pending header done.
    fn reset(&self) -> Result<(), LoopbackError> {
        match *self {
            Self::In(h) => stop_then_reset(
                || check(unsafe { waveInStop(h) }, "waveInStop"),
                || check(unsafe { waveInReset(h) }, "waveInReset"),
            ),
            Self::Out(h) => check(unsafe { waveOutReset(h) }, "waveOutReset"),
        }
    }

    fn close(&self) -> Result<(), LoopbackError> {
        match *self {
            Self::In(h) => check(unsafe { waveInClose(h) }, "waveInClose"),
            Self::Out(h) => check(unsafe { waveOutClose(h) }, "waveOutClose"),
        }
    }
}

struct StreamInner {
    handle: WaveHandle,
    format: AudioFormat,
    event: EventHandle,
    in_flight: Mutex<Vec<InFlight>>,
    events: CompletionSender,
    closing: AtomicBool,
}

// SAFETY: the raw wave and event handles are process-wide kernel/driver
// handles, valid from any thread. Header memory is only touched under the
// `in_flight` lock or by the driver while queued.
unsafe impl Send for StreamInner {}
unsafe impl Sync for StreamInner {}

impl StreamInner {
    /// Send every finished header back, oldest first.
    fn drain_done(&self) {
        let mut in_flight = self.in_flight.lock();
        let mut i = 0;
        while i < in_flight.len() {
            if !in_flight[i].is_done() {
                i += 1;
                continue;
            }
            let mut done = in_flight.remove(i);
            let bytes = match self.handle.direction() {
                Direction::Input => done.bytes_recorded(),
                Direction::Output => done.buffer.len(),
            };
            let unprepared = unsafe { self.handle.unprepare(done.header_ptr()) };
            let Some(done) = keep_if_unprepared(done, unprepared) else {
                continue;
            };
            let _ = self.events.send(StreamEvent::Completed(Completion {
                token: done.token,
                buffer: done.buffer,
                bytes,
            }));
        }
    }

    /// Take back every header without sending completions. Headers the
    /// driver refuses to unprepare are leaked, not freed.
    fn discard_all(&self) {
        for mut lent in self.in_flight.lock().drain(..) {
            let unprepared = unsafe { self.handle.unprepare(lent.header_ptr()) };
            drop(keep_if_unprepared(lent, unprepared));
        }
    }
}

fn run_pump(inner: Arc<StreamInner>) {
    while !inner.closing.load(Ordering::Acquire) {
        unsafe {
            WaitForSingleObject(inner.event.0, PUMP_WAIT_MS);
        }
        inner.drain_done();
    }
}

/// An open waveIn or waveOut device.
pub struct WaveStream {
    inner: Arc<StreamInner>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
    index: usize,
}

impl WaveStream {
    pub fn open(
        direction: Direction,
        index: usize,
        format: AudioFormat,
        events: CompletionSender,
    ) -> Result<Self, LoopbackError> {
        let device_id = u32::try_from(index).map_err(|_| LoopbackError::DeviceUnavailable)?;
        let event = EventHandle::new()?;
        let handle = WaveHandle::open(direction, device_id, &wave_format(format), &event)?;

        let inner = Arc::new(StreamInner {
            handle,
            format,
            event,
            in_flight: Mutex::new(Vec::new()),
            events,
            closing: AtomicBool::new(false),
        });

        let pump_name = match direction {
            Direction::Input => format!("wavein-pump-{}", index),
            Direction::Output => format!("waveout-pump-{}", index),
        };
        let pump = {
            let inner = Arc::clone(&inner);
            thread::Builder::new().name(pump_name).spawn(move || run_pump(inner))
        };
        let pump = match pump {
            Ok(pump) => pump,
            Err(e) => {
                if let Err(close_err) = handle.close() {
                    log::error!("Failed to close wave device {}: {}", index, close_err);
                }
                return Err(LoopbackError::Backend(format!(
                    "failed to spawn wave pump: {}",
                    e
                )));
            }
        };

        Ok(Self {
            inner,
            pump: Mutex::new(Some(pump)),
            index,
        })
    }

    /// Stop the pump, reclaim every header and close the device. Idempotent.
    fn shutdown(&self) -> Result<(), LoopbackError> {
        let Some(pump) = self.pump.lock().take() else {
            return Ok(());
        };
        self.inner.closing.store(true, Ordering::Release);
        self.inner.event.signal();
        if pump.join().is_err() {
            log::error!("Wave pump for device {} panicked", self.index);
        }

        if let Err(e) = self.inner.handle.reset() {
            log::error!("Reset before close failed on device {}: {}", self.index, e);
        }
        self.inner.discard_all();
        self.inner.handle.close()
    }
}

impl DeviceStream for WaveStream {
    fn format(&self) -> AudioFormat {
        self.inner.format
    }

    fn submit(&self, token: BufferToken, buffer: Vec<u8>) -> Result<(), SubmitError> {
        let Ok(length) = u32::try_from(buffer.len()) else {
            return Err(SubmitError {
                error: LoopbackError::Backend("buffer larger than 4 GiB".into()),
                token,
                buffer,
            });
        };

        let mut lent = InFlight {
            token,
            header: Box::new(AlignedHeader(WAVEHDR::default())),
            buffer,
        };
        lent.header.0.lpData = PSTR(lent.buffer.as_mut_ptr());
        lent.header.0.dwBufferLength = length;

        let mut in_flight = self.inner.in_flight.lock();
        if let Err(error) = unsafe { self.inner.handle.queue(lent.header_ptr()) } {
            return Err(SubmitError {
                error,
                token,
                buffer: lent.buffer,
            });
        }
        in_flight.push(lent);
        Ok(())
    }

    fn start(&self) -> Result<(), LoopbackError> {
        self.inner.handle.start()
    }

    fn reset(&self) -> Result<(), LoopbackError> {
        self.inner.handle.reset()?;
        // Reset marks every header done before returning; collect them here
        // rather than waiting for the pump.
        self.inner.drain_done();
        let stuck = self.inner.in_flight.lock().len();
        if stuck > 0 {
            log::warn!(
                "{} wave headers still pending on device {} after reset",
                stuck,
                self.index
            );
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), LoopbackError> {
        self.shutdown()
    }
}

impl Drop for WaveStream {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Failed to close wave device {}: {}", self.index, e);
        }
    }
}
