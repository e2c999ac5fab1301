mod cli;

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use loopback_core::{
    AudioBackend, ClockMode, DeviceInfo, LoopbackConfig, LoopbackCoordinator, LoopbackError,
    Signal, VirtualBackend,
};

use cli::{Args, Command};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Loopback(#[from] LoopbackError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration file: {0}")]
    Config(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(&args);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), CliError> {
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => LoopbackConfig::default(),
    };
    let backend = select_backend(args.use_virtual, &config);
    let coordinator = LoopbackCoordinator::new(backend, config)?;

    match args.command {
        Command::List { json } => list_devices(&coordinator, json),
        Command::Run {
            input,
            output,
            volume,
        } => monitor(&coordinator, input, output, volume),
    }
}

fn load_config(path: &Path) -> Result<LoopbackConfig, CliError> {
    let text = fs::read_to_string(path)?;
    let config: LoopbackConfig = serde_json::from_str(&text)?;
    config.validate()?;
    log::info!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(target_os = "windows")]
fn platform_backend() -> Option<Arc<dyn AudioBackend>> {
    Some(Arc::new(loopback_windows::WinmmBackend::new()))
}

#[cfg(not(target_os = "windows"))]
fn platform_backend() -> Option<Arc<dyn AudioBackend>> {
    None
}

fn select_backend(use_virtual: bool, config: &LoopbackConfig) -> Arc<dyn AudioBackend> {
    let platform = if use_virtual { None } else { platform_backend() };
    platform.unwrap_or_else(|| {
        log::info!("Using software test devices");
        Arc::new(test_devices(config))
    })
}

/// Clocked software devices pacing one buffer per buffer duration.
fn test_devices(config: &LoopbackConfig) -> VirtualBackend {
    let period = Duration::from_millis(u64::from(config.buffer_duration_ms));
    VirtualBackend::new(ClockMode::Clocked { period })
        .with_input(
            "Test Tone (440 Hz)",
            Signal::Tone {
                frequency_hz: 440.0,
                amplitude: 8_000,
            },
        )
        .with_input("Silence", Signal::Silence)
        .with_output("Null Output")
}

fn list_devices(coordinator: &LoopbackCoordinator, json: bool) -> Result<(), CliError> {
    let inputs = coordinator.list_input_devices()?;
    let outputs = coordinator.list_output_devices()?;

    if json {
        let listing = serde_json::json!({ "inputs": inputs, "outputs": outputs });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    print_section("Input devices", &inputs);
    print_section("Output devices", &outputs);
    Ok(())
}

fn print_section(title: &str, devices: &[DeviceInfo]) {
    println!("{}:", title);
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        println!("  [{}] {}", device.index, device.name);
    }
}

/// Run until `q` or end of input. Each line is a volume in percent, or `s`
/// for delivery statistics.
fn monitor(
    coordinator: &LoopbackCoordinator,
    input: usize,
    output: usize,
    volume: Option<u8>,
) -> Result<(), CliError> {
    if let Some(percent) = volume {
        coordinator.set_gain_percent(percent);
    }
    coordinator.start(input, output)?;

    if let Some(info) = coordinator.session_info() {
        println!(
            "Looping input {} to output {} at {} (volume {}%)",
            info.input_index, info.output_index, info.format, info.gain_percent
        );
    }
    println!("Enter a volume 0-100, `s` for statistics, `q` to quit.");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match line.trim() {
            "" => {}
            "q" | "quit" => break,
            "s" | "stats" => {
                let diagnostics = coordinator.diagnostics();
                println!("{}", serde_json::to_string_pretty(&diagnostics)?);
            }
            other => match other.parse::<u8>() {
                Ok(percent) if percent <= 100 => {
                    coordinator.set_gain_percent(percent);
                    println!("Volume {}%", coordinator.gain_percent());
                }
                _ => eprintln!("expected a volume 0-100, `s` or `q`"),
            },
        }
        io::stdout().flush()?;
    }

    coordinator.stop();
    let diagnostics = coordinator.diagnostics();
    log::info!(
        "Session ended: {} chunks captured, {} played, {} dropped",
        diagnostics.capture.chunks_delivered,
        diagnostics.playback.chunks_delivered,
        diagnostics.capture.transient_drops
    );
    Ok(())
}
