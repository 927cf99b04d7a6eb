//! Runtime configuration handed to the engine.

use super::types::{
    Config, MetricsConfig, NotifierConfig, TimerConfig, WatchFileConfig,
};
use crate::error::ConfigError;
use std::time::Duration;

/// Settings of the file watcher's dispatch loop and limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Maintenance tick period.
    pub retry_interval: Duration,
    /// Restart attempts before a file is given up on.
    pub max_retries: u32,
    /// Limiter burst capacity.
    pub burst: u32,
    /// Limiter refill interval.
    pub refill: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            max_retries: 6,
            burst: crate::limiter::DEFAULT_BURST,
            refill: crate::limiter::DEFAULT_REFILL,
        }
    }
}

/// Validated configuration ready to start the engine.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub notifier: Option<NotifierConfig>,
    pub metrics: MetricsConfig,
    pub watcher: WatcherSettings,
    pub files: Vec<WatchFileConfig>,
    pub heartbeat: Option<Duration>,
    pub timers: Vec<TimerConfig>,
}

impl Config {
    /// Validate and convert into runtime-ready form.
    ///
    /// # Errors
    /// Returns the first validation error. Call [`Config::validate`] first to
    /// report all of them.
    pub fn compile(self) -> Result<RuntimeConfig, ConfigError> {
        if let Err(mut errors) = self.validate() {
            return Err(errors.remove(0));
        }

        let watch = self.file_watch;
        let files = watch
            .files
            .into_iter()
            .map(|mut file| {
                // An empty skip pattern means "no skip".
                file.skip = file.skip.filter(|s| !s.is_empty());
                file
            })
            .collect();

        Ok(RuntimeConfig {
            notifier: self.notifier,
            metrics: self.metrics,
            watcher: WatcherSettings {
                retry_interval: watch.retry_interval,
                max_retries: watch.max_retries,
                burst: watch.burst,
                refill: watch.refill,
            },
            files,
            heartbeat: self.timers.heartbeat,
            timers: self.timers.custom,
        })
    }
}
