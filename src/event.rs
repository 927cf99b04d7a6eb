//! Event types describing why an action fired or a request was sent.

use serde::Serialize;
use std::fmt;

/// Cause of an action firing, carried through to outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Requested by a person (CLI, GUI or web handler).
    User,
    /// Fired by a ticker.
    Schedule,
    /// Triggered by an OS signal.
    Signal,
    /// Fired as part of a configuration reload.
    Reload,
    /// Fired once at application start.
    Start,
    /// Fired while the application shuts down.
    Stop,
    /// Requested through the remote API.
    Api,
    /// Produced by the file watcher.
    File,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::User => "user",
            EventType::Schedule => "schedule",
            EventType::Signal => "signal",
            EventType::Reload => "reload",
            EventType::Start => "start",
            EventType::Stop => "stop",
            EventType::Api => "api",
            EventType::File => "file",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serde_name() {
        for event in [
            EventType::User,
            EventType::Schedule,
            EventType::Signal,
            EventType::Reload,
            EventType::Start,
            EventType::Stop,
            EventType::Api,
            EventType::File,
        ] {
            let json = serde_json::to_string(&event).unwrap();
            assert_eq!(json, format!("\"{}\"", event));
        }
    }
}
