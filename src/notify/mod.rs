//! Fire-and-forget notifications to the remote notifier.
//!
//! Producers (file watcher, timers) build a [`Request`] and hand it to the
//! [`NotificationQueue`], which never blocks. A single
//! [`NotificationWorker`] drains the queue and delivers each request through
//! a [`Notifier`] implementation.
//!
//! # Architecture
//!
//! ```text
//! filewatch / actions --send_data--> NotificationQueue --> NotificationWorker --> Notifier
//!                                    (broadcast, drop oldest)                      |
//!                                                                   WebhookNotifier | LogNotifier
//! ```
//!
//! Failures are logged and counted by the worker; producers never see them.

mod log;
mod queue;
mod traits;
mod webhook;

use serde::Serialize;

use crate::event::EventType;

pub use log::LogNotifier;
pub use queue::{DEFAULT_QUEUE_CAPACITY, NotificationQueue, NotificationWorker, backoff_delay};
pub use traits::Notifier;
pub use webhook::{WebhookNotifier, WirePayload};

/// Endpoint a request is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    /// Matched lines from watched files.
    #[serde(rename = "logwatch")]
    LogLine,
    /// Custom timer firings.
    Timer,
    /// Periodic liveness report.
    Heartbeat,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::LogLine => "logwatch",
            Route::Timer => "timer",
            Route::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification waiting to be delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub route: Route,
    pub event: EventType,
    /// Log the payload body when the request is enqueued.
    pub log_payload: bool,
    /// Human-readable line logged when the request is enqueued.
    pub log_message: String,
    pub payload: serde_json::Value,
}

impl Request {
    /// Build a request from any serializable payload.
    pub fn new<T: Serialize>(
        route: Route,
        event: EventType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            route,
            event,
            log_payload: false,
            log_message: String::new(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn with_log_message(mut self, message: impl Into<String>) -> Self {
        self.log_message = message.into();
        self
    }

    pub fn with_log_payload(mut self, log_payload: bool) -> Self {
        self.log_payload = log_payload;
        self
    }
}
