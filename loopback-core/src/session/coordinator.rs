use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::engine::capture::CaptureEngine;
use crate::engine::playback::PlaybackEngine;
use crate::models::chunk::AudioChunk;
use crate::models::config::LoopbackConfig;
use crate::models::device::{DeviceInfo, Direction};
use crate::models::error::{DeliveryFault, LoopbackError};
use crate::models::format::AudioFormat;
use crate::models::stats::{DeliveryStats, LoopbackDiagnostics};
use crate::processing::gain::{apply_gain_to_chunk, GainControl};
use crate::traits::backend::AudioBackend;
use crate::traits::chunk_sink::ChunkCallback;

/// One live loopback run.
struct Session {
    id: String,
    input: usize,
    output: usize,
    format: AudioFormat,
    started_at: String,
    capture: CaptureEngine,
    playback: Arc<PlaybackEngine>,
    capture_stats: Arc<DeliveryStats>,
    playback_stats: Arc<DeliveryStats>,
}

impl Session {
    fn diagnostics(&self) -> LoopbackDiagnostics {
        LoopbackDiagnostics {
            capture: self.capture_stats.snapshot(),
            playback: self.playback_stats.snapshot(),
            delivery_suspended: self.capture.is_delivery_suspended(),
        }
    }
}

/// Description of the running session for a control surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub input_index: usize,
    pub output_index: usize,
    pub format: AudioFormat,
    pub started_at: String,
    pub gain_percent: u8,
}

/// Routes one input device through the gain stage to one output device.
///
/// ```text
/// [CaptureEngine] → AudioChunk → apply_gain → [PlaybackEngine]
///                                    ↑
///                        GainControl (set_gain from any thread)
/// ```
///
/// The only control surface: list devices, start, stop, set gain. All
/// methods take `&self` and may be called from any thread.
pub struct LoopbackCoordinator {
    backend: Arc<dyn AudioBackend>,
    config: LoopbackConfig,
    gain: Arc<GainControl>,
    session: Mutex<Option<Session>>,
    last_diagnostics: Mutex<LoopbackDiagnostics>,
}

impl LoopbackCoordinator {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        config: LoopbackConfig,
    ) -> Result<Self, LoopbackError> {
        config.validate()?;
        Ok(Self {
            backend,
            gain: Arc::new(GainControl::from_percent(config.initial_gain_percent)),
            config,
            session: Mutex::new(None),
            last_diagnostics: Mutex::new(LoopbackDiagnostics::default()),
        })
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    pub fn list_input_devices(&self) -> Result<Vec<DeviceInfo>, LoopbackError> {
        self.backend.list_devices(Direction::Input)
    }

    pub fn list_output_devices(&self) -> Result<Vec<DeviceInfo>, LoopbackError> {
        self.backend.list_devices(Direction::Output)
    }

    /// Start looping `input` to `output` at the configured format.
    pub fn start(&self, input: usize, output: usize) -> Result<(), LoopbackError> {
        self.start_with_format(input, output, self.config.format)
    }

    /// Start looping `input` to `output` at `format`.
    ///
    /// Calling again with the same devices and format while running does
    /// nothing; any other pair returns [`LoopbackError::AlreadyRunning`].
    /// On failure nothing is left open.
    pub fn start_with_format(
        &self,
        input: usize,
        output: usize,
        format: AudioFormat,
    ) -> Result<(), LoopbackError> {
        let mut session = self.session.lock();
        if let Some(running) = session.as_ref() {
            if running.input == input && running.output == output && running.format == format {
                return Ok(());
            }
            return Err(LoopbackError::AlreadyRunning);
        }

        let config = LoopbackConfig {
            format,
            ..self.config.clone()
        };
        config.validate()?;

        let capture_stats = Arc::new(DeliveryStats::new());
        let playback_stats = Arc::new(DeliveryStats::new());

        // Playback first: the capture callback needs somewhere to send chunks
        // from its very first completion.
        let playback = Arc::new(PlaybackEngine::open(
            self.backend.as_ref(),
            output,
            &config,
            Arc::clone(&playback_stats),
        )?);

        let on_chunk = route_through_gain(Arc::clone(&self.gain), Arc::clone(&playback));
        let capture = match CaptureEngine::open(
            self.backend.as_ref(),
            input,
            &config,
            on_chunk,
            Arc::clone(&capture_stats),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                playback.dispose();
                return Err(e);
            }
        };

        if let Err(e) = capture.start() {
            capture.close();
            playback.dispose();
            return Err(e);
        }

        let id = uuid::Uuid::new_v4().to_string();
        log::info!(
            "Loopback session {} started: input {} → output {} at {}",
            id,
            input,
            output,
            format
        );
        *session = Some(Session {
            id,
            input,
            output,
            format,
            started_at: chrono::Utc::now().to_rfc3339(),
            capture,
            playback,
            capture_stats,
            playback_stats,
        });
        Ok(())
    }

    /// Stop capture, then dispose playback. Idempotent; safe to race.
    pub fn stop(&self) {
        let mut session = self.session.lock();
        let Some(running) = session.take() else {
            return;
        };

        let Session {
            id,
            capture,
            playback,
            capture_stats,
            playback_stats,
            ..
        } = running;

        let delivery_suspended = capture.is_delivery_suspended();
        capture.close();
        playback.dispose();

        // Kept so a stopped session can still be inspected.
        *self.last_diagnostics.lock() = LoopbackDiagnostics {
            capture: capture_stats.snapshot(),
            playback: playback_stats.snapshot(),
            delivery_suspended,
        };
        log::info!("Loopback session {} stopped", id);
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Linear gain in [0, 1]; takes effect on the next chunk.
    pub fn set_gain(&self, gain: f32) {
        self.gain.set(gain);
    }

    /// Gain as a percentage; values above 100 are treated as 100.
    pub fn set_gain_percent(&self, percent: u8) {
        self.gain.set_percent(percent);
        log::debug!("Gain set to {}%", self.gain.percent());
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn gain_percent(&self) -> u8 {
        self.gain.percent()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session.lock().as_ref().map(|s| SessionInfo {
            id: s.id.clone(),
            input_index: s.input,
            output_index: s.output,
            format: s.format,
            started_at: s.started_at.clone(),
            gain_percent: self.gain.percent(),
        })
    }

    /// Counters of the running session, or of the last one once stopped.
    pub fn diagnostics(&self) -> LoopbackDiagnostics {
        match self.session.lock().as_ref() {
            Some(session) => session.diagnostics(),
            None => *self.last_diagnostics.lock(),
        }
    }
}

impl Drop for LoopbackCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn route_through_gain(gain: Arc<GainControl>, playback: Arc<PlaybackEngine>) -> ChunkCallback {
    Arc::new(move |mut chunk: AudioChunk| -> Result<(), DeliveryFault> {
        apply_gain_to_chunk(&mut chunk, gain.get());
        playback.play(chunk)
    })
}
