//! Configuration loading and validation for trigwatch.
//!
//! This module handles loading the YAML configuration file,
//! validation, and managing environment variables for secrets.

mod env;
mod runtime;
mod secret;
mod types;

// Re-exports publics
pub use env::resolve_env_vars;
pub use runtime::{RuntimeConfig, WatcherSettings};
pub use secret::SecretString;
pub use types::{
    Config, DEFAULT_CONFIG_PATH, FileWatchConfig, MetricsConfig, NotifierConfig,
    RESERVED_ACTION_NAMES, TimerConfig, TimersConfig, WatchFileConfig,
};
