//! Windows audio device enumeration via WinMM.
//!
//! Device indices are the WinMM ordinals `waveInOpen` / `waveOutOpen` take,
//! so a listing can be handed straight back to `start`.

use std::mem::size_of;

use windows::Win32::Media::Audio::*;
use windows::Win32::Media::MMSYSERR_NOERROR;

use loopback_core::models::device::{DeviceInfo, Direction};

/// Lists waveIn / waveOut endpoints with their product names.
pub struct DeviceEnumerator;

impl DeviceEnumerator {
    /// Capture endpoints, in WinMM index order.
    pub fn list_input_devices() -> Vec<DeviceInfo> {
        let count = unsafe { waveInGetNumDevs() } as usize;
        (0..count)
            .map(|index| {
                let mut caps = WAVEINCAPSW::default();
                let rc = unsafe {
                    waveInGetDevCapsW(index, &mut caps, size_of::<WAVEINCAPSW>() as u32)
                };
                let name = if rc == MMSYSERR_NOERROR {
                    let raw = caps.szPname;
                    name_from_wide(&raw)
                } else {
                    log::warn!("waveInGetDevCapsW({}) failed with MMRESULT {}", index, rc);
                    format!("Input {}", index)
                };
                DeviceInfo {
                    index,
                    name,
                    direction: Direction::Input,
                }
            })
            .collect()
    }

    /// Render endpoints, in WinMM index order.
    pub fn list_output_devices() -> Vec<DeviceInfo> {
        let count = unsafe { waveOutGetNumDevs() } as usize;
        (0..count)
            .map(|index| {
                let mut caps = WAVEOUTCAPSW::default();
                let rc = unsafe {
                    waveOutGetDevCapsW(index, &mut caps, size_of::<WAVEOUTCAPSW>() as u32)
                };
                let name = if rc == MMSYSERR_NOERROR {
                    let raw = caps.szPname;
                    name_from_wide(&raw)
                } else {
                    log::warn!("waveOutGetDevCapsW({}) failed with MMRESULT {}", index, rc);
                    format!("Output {}", index)
                };
                DeviceInfo {
                    index,
                    name,
                    direction: Direction::Output,
                }
            })
            .collect()
    }
}

/// Decode a NUL-terminated UTF-16 product name.
fn name_from_wide(raw: &[u16]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..len]).trim().to_string()
}
