//! Command-line interface for settle
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Debounce recorded recognition output and inspect what settles
#[derive(Parser, Debug)]
#[command(
    name = "settle",
    version,
    about = "Debounce recorded recognition output and inspect what settles"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug logs, -vv: trace logs)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Parse a duration string.
///
/// Bare numbers are milliseconds; anything else goes through `humantime`
/// (`50ms`, `1s`, `1s 500ms`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    // Bare number → milliseconds
    if let Ok(ms) = s.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay an observation log through a debounced store
    Replay {
        /// Log file with `<offset_ms><TAB><text>` lines; `-` or omitted reads stdin
        #[arg(value_name = "FILE")]
        input: Option<PathBuf>,

        /// Quiet period (default: from config). Examples: 50, 50ms, 1s
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        quiet_period: Option<Duration>,

        /// Interval at which the latest observation is re-pushed
        #[arg(long, value_name = "DURATION", default_value = "10ms", value_parser = parse_duration)]
        frame: Duration,

        /// Push only the logged observations, without frame repeats
        #[arg(long, conflicts_with = "frame")]
        no_frames: bool,

        /// Print settlements as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration (file, then environment overrides)
    Show,
    /// Print the configuration file path
    Path,
}
