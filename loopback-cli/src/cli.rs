//! Command-line interface for the loopback monitor
//!
//! Handles argument parsing and logging configuration.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

/// loopback-monitor - route a live input device to an output device
#[derive(Parser, Debug)]
#[command(name = "loopback-monitor")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Use software test devices instead of the platform audio API
    #[arg(long = "virtual", global = true)]
    pub use_virtual: bool,

    /// JSON configuration file (missing fields take their defaults)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List input and output devices
    List {
        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },
    /// Loop an input device to an output device until `q` or end of input
    Run {
        /// Input device index
        #[arg(short, long, default_value_t = 0)]
        input: usize,

        /// Output device index
        #[arg(short, long, default_value_t = 0)]
        output: usize,

        /// Initial volume in percent
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
        volume: Option<u8>,
    },
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn);
    for module in ["loopback_monitor", "loopback_core", "loopback_windows"] {
        builder.filter_module(module, args.log_level());
    }
    builder.parse_default_env();
    builder.format_timestamp_millis().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_to_first_devices() {
        let args = Args::parse_from(["loopback-monitor", "run"]);
        match args.command {
            Command::Run {
                input,
                output,
                volume,
            } => {
                assert_eq!((input, output), (0, 0));
                assert_eq!(volume, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn volume_above_100_is_rejected() {
        let parsed = Args::try_parse_from(["loopback-monitor", "run", "--volume", "150"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn verbosity_maps_to_levels() {
        let args = Args::parse_from(["loopback-monitor", "-vv", "list"]);
        assert_eq!(args.log_level(), LevelFilter::Debug);
        let args = Args::parse_from(["loopback-monitor", "list", "--quiet"]);
        assert_eq!(args.log_level(), LevelFilter::Error);
    }
}
