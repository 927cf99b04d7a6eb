// src/lib.rs
//! trigwatch - timer/trigger bus and log file watcher forwarding matches to a notifier.

pub mod actions;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod filewatch;
pub mod limiter;
pub mod metrics;
pub mod mux;
pub mod notify;

// Re-export commonly used types
pub use actions::{Action, ActionContext, ActionInput, ActionRegistry, TriggerName};
pub use cli::LogFormat;
pub use engine::{Engine, ReloadHandle};
pub use event::EventType;
pub use filewatch::{FileWatcher, Match, WatchFile};
pub use limiter::LeakyBucket;
pub use metrics::{MetricsServer, initialize_metrics, register_metric_descriptions};
pub use mux::{Handler, Multiplexer, MuxHandle, Source};
pub use notify::{
    DEFAULT_QUEUE_CAPACITY, LogNotifier, NotificationQueue, NotificationWorker, Notifier, Request,
    Route, WebhookNotifier, backoff_delay,
};
