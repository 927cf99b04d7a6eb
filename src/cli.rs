//! Command-line interface for trigwatch using clap.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::DEFAULT_CONFIG_PATH;

/// Default bound on how long shutdown waits for actions and tails to drain.
pub const DEFAULT_SHUTDOWN_TIMEOUT: &str = "10s";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format for journalctl (default).
    #[default]
    Text,
    /// Structured JSON format for log aggregation.
    Json,
}

/// Timer/trigger bus and log file watcher.
#[derive(Parser, Debug)]
#[command(name = "trigwatch")]
#[command(version)]
#[command(about = "Run timers and tail log files, forwarding matched lines to a notifier")]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Validate configuration and exit.
    #[arg(long = "validate")]
    pub validate: bool,

    /// Log format: text or json.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, env = "LOG_FORMAT")]
    pub log_format: LogFormat,

    /// How long to wait for running actions and tails on shutdown (e.g. "10s").
    #[arg(long = "shutdown-timeout", default_value = DEFAULT_SHUTDOWN_TIMEOUT, value_parser = parse_duration)]
    pub shutdown_timeout: Duration,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}
