//! Core configuration types and loading.

use super::secret::SecretString;
use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/trigwatch/config.yaml";

/// Action names reserved by the engine's built-in actions.
pub const RESERVED_ACTION_NAMES: &[&str] = &[
    crate::engine::HEARTBEAT_ACTION,
    crate::engine::FILE_STATUS_ACTION,
    crate::engine::ADD_WATCHER_ACTION,
    crate::engine::RELOAD_ACTION,
];

/// Main configuration structure for trigwatch.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Remote notifier. Without it, requests are only logged.
    #[serde(default)]
    pub notifier: Option<NotifierConfig>,
    /// Metrics exposition configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Log file watching.
    #[serde(default)]
    pub file_watch: FileWatchConfig,
    /// Timer actions.
    #[serde(default)]
    pub timers: TimersConfig,
}

/// Remote notifier endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Base URL; the route is appended (`<url>/logwatch`). Supports `${VAR}`.
    pub url: String,
    /// Sent as `X-API-Key`. Supports `${VAR}`.
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Per-request timeout.
    #[serde(default = "default_notifier_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_notifier_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Metrics exposition configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics exposition is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Port to expose metrics on (default: 9090).
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

pub(crate) fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

/// File watcher settings and the files to watch.
#[derive(Debug, Clone, Deserialize)]
pub struct FileWatchConfig {
    /// Maintenance tick: how often dead tails are retried.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Restart attempts before a file is given up on.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Matched lines allowed through in one burst.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Time after which the burst allowance is restored.
    #[serde(default = "default_refill", with = "humantime_serde")]
    pub refill: Duration,
    #[serde(default)]
    pub files: Vec<WatchFileConfig>,
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    6
}

fn default_burst() -> u32 {
    crate::limiter::DEFAULT_BURST
}

fn default_refill() -> Duration {
    crate::limiter::DEFAULT_REFILL
}

impl Default for FileWatchConfig {
    fn default() -> Self {
        Self {
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
            burst: default_burst(),
            refill: default_refill(),
            files: Vec::new(),
        }
    }
}

/// One watched file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WatchFileConfig {
    pub path: String,
    /// Lines matching this pattern are forwarded.
    pub regex: String,
    /// Lines also matching this pattern are skipped.
    #[serde(default)]
    pub skip: Option<String>,
    /// Poll instead of waiting for filesystem events.
    #[serde(default)]
    pub poll: bool,
    /// The path is a named pipe.
    #[serde(default)]
    pub pipe: bool,
    /// Fail (and retry) instead of waiting while the file is missing.
    #[serde(default)]
    pub must_exist: bool,
    /// Log the full match payload when forwarding.
    #[serde(default)]
    pub log_match: bool,
}

impl WatchFileConfig {
    pub fn new(path: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            regex: regex.into(),
            ..Self::default()
        }
    }

    pub fn with_skip(mut self, skip: impl Into<String>) -> Self {
        self.skip = Some(skip.into());
        self
    }
}

/// Timer actions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimersConfig {
    /// Interval of the heartbeat request. Disabled when unset.
    #[serde(default, with = "humantime_serde")]
    pub heartbeat: Option<Duration>,
    #[serde(default)]
    pub custom: Vec<TimerConfig>,
}

/// A custom timer that sends a `timer` request each interval.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimerConfig {
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Config {
    /// Load configuration from a file path.
    ///
    /// # Errors
    /// Returns [`ConfigError::LoadError`] if the file cannot be read.
    /// Returns [`ConfigError::ValidationError`] if the YAML is invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.display(), e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from YAML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate the whole configuration, collecting every error.
    ///
    /// # Errors
    /// Returns a `Vec<ConfigError>` containing all validation errors found.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();

        if let Some(notifier) = &self.notifier {
            if notifier.url.trim().is_empty() {
                errors.push(ConfigError::ValidationError(
                    "notifier.url cannot be empty".to_string(),
                ));
            }
            if notifier.timeout.is_zero() {
                errors.push(ConfigError::ValidationError(
                    "notifier.timeout must be greater than zero".to_string(),
                ));
            }
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            errors.push(ConfigError::ValidationError(
                "metrics.port cannot be 0 when metrics are enabled".to_string(),
            ));
        }

        let watch = &self.file_watch;
        if watch.retry_interval.is_zero() {
            errors.push(ConfigError::ValidationError(
                "file_watch.retry_interval must be greater than zero".to_string(),
            ));
        }
        if watch.refill.is_zero() {
            errors.push(ConfigError::ValidationError(
                "file_watch.refill must be greater than zero".to_string(),
            ));
        }
        if watch.burst == 0 {
            errors.push(ConfigError::ValidationError(
                "file_watch.burst must be greater than zero".to_string(),
            ));
        }

        let mut paths = HashSet::new();
        for file in &watch.files {
            if file.path.trim().is_empty() {
                errors.push(ConfigError::ValidationError(
                    "file_watch.files: path cannot be empty".to_string(),
                ));
                continue;
            }
            if !paths.insert(file.path.as_str()) {
                errors.push(ConfigError::ValidationError(format!(
                    "file_watch.files: duplicate path '{}'",
                    file.path
                )));
            }
            if file.regex.is_empty() {
                errors.push(ConfigError::InvalidRegex {
                    path: file.path.clone(),
                    message: "regex cannot be empty".to_string(),
                });
            } else if let Err(e) = Regex::new(&file.regex) {
                errors.push(ConfigError::InvalidRegex {
                    path: file.path.clone(),
                    message: e.to_string(),
                });
            }
            if let Some(skip) = &file.skip
                && let Err(e) = Regex::new(skip)
            {
                errors.push(ConfigError::InvalidRegex {
                    path: file.path.clone(),
                    message: format!("skip: {}", e),
                });
            }
        }

        if let Some(heartbeat) = self.timers.heartbeat
            && heartbeat.is_zero()
        {
            errors.push(ConfigError::ValidationError(
                "timers.heartbeat must be greater than zero".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for timer in &self.timers.custom {
            if timer.name.trim().is_empty() {
                errors.push(ConfigError::ValidationError(
                    "timers.custom: name cannot be empty".to_string(),
                ));
            } else if RESERVED_ACTION_NAMES.contains(&timer.name.as_str()) {
                errors.push(ConfigError::ValidationError(format!(
                    "timers.custom: name '{}' is reserved",
                    timer.name
                )));
            } else if !names.insert(timer.name.as_str()) {
                errors.push(ConfigError::ValidationError(format!(
                    "timers.custom: duplicate name '{}'",
                    timer.name
                )));
            }
            if timer.interval.is_zero() {
                errors.push(ConfigError::ValidationError(format!(
                    "timers.custom '{}': interval must be greater than zero",
                    timer.name
                )));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
