//! # loopback-windows
//!
//! Windows WinMM backend for loopback-core.
//!
//! Provides:
//! - `WinmmBackend` : `AudioBackend` over `waveIn*` / `waveOut*`
//! - `WaveStream` : one open wave device, completions pumped from an event
//! - `DeviceEnumerator` : endpoint listing via `wave*GetDevCapsW`
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use loopback_core::{LoopbackConfig, LoopbackCoordinator};
//! use loopback_windows::WinmmBackend;
//!
//! let backend = Arc::new(WinmmBackend::new());
//! let coordinator = LoopbackCoordinator::new(backend, LoopbackConfig::default())?;
//! coordinator.start(0, 0)?;
//! ```

#[cfg(target_os = "windows")]
pub mod device_enumerator;
#[cfg(target_os = "windows")]
pub mod wave_stream;
#[cfg(target_os = "windows")]
pub mod winmm_backend;

#[cfg(target_os = "windows")]
pub use device_enumerator::DeviceEnumerator;
#[cfg(target_os = "windows")]
pub use wave_stream::WaveStream;
#[cfg(target_os = "windows")]
pub use winmm_backend::WinmmBackend;
