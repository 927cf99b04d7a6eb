//! Centralized error types for trigwatch using thiserror.
//!
//! Runtime conditions are reported through these enums. Programmer-contract
//! violations (stopping something that is not running, registering an action
//! with neither a channel nor a ticker) panic instead.

use thiserror::Error;

/// Errors related to configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load config file: {0}")]
    LoadError(String),
    #[error("invalid configuration: {0}")]
    ValidationError(String),
    #[error("invalid regex pattern for '{path}': {message}")]
    InvalidRegex { path: String, message: String },
}

/// Errors returned when a file cannot be (re)watched.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("no regexp match provided, ignored: {path}")]
    MissingRegex { path: String },
    #[error("regexp match compile failed, ignored: {path}: {message}")]
    InvalidRegex { path: String, message: String },
    #[error("regexp skip compile failed, ignored: {path}: {message}")]
    InvalidSkip { path: String, message: String },
    #[error("watching file {path}: {source}")]
    Tail {
        path: String,
        #[source]
        source: TailError,
    },
    #[error("file is already being watched: {path}")]
    AlreadyWatching { path: String },
    #[error("file watcher is not running")]
    NotRunning,
}

/// Errors produced by a single file tail.
#[derive(Error, Debug, Clone)]
pub enum TailError {
    #[error("file does not exist: {0}")]
    NotFound(String),
    #[error("i/o error on {path}: {message}")]
    Io { path: String, message: String },
}

impl TailError {
    pub(crate) fn io(path: &str, err: &std::io::Error) -> Self {
        TailError::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

/// Errors related to notification sending.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("failed to send notification: {0}")]
    SendFailed(String),
    #[error("max retries exceeded")]
    MaxRetriesExceeded,
}

/// Errors related to notification queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("notification queue closed")]
    Closed,
}
