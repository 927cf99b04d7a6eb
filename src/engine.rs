//! Engine wiring the action registry, the file watcher and the notification queue.
//!
//! # Architecture
//!
//! ```text
//! main.rs
//!     |
//!     v
//! engine.rs (Engine)
//!     |
//!     +-- ActionRegistry --> heartbeat / file-watcher-status / add-file-watcher / reload / custom timers
//!     |                           |
//!     +-- FileWatcher ------------+--> NotificationQueue --> NotificationWorker --> Notifier
//! ```
//!
//! The engine owns everything that used to be process-global: the registry,
//! the watcher, the queue handle, the reload channel and the start time.
//!
//! A reload stops the engine with [`EventType::Reload`] and builds a fresh one
//! from the new configuration with [`Engine::rebuild`]; the queue and the
//! reload channel carry over, so every action gets a new input channel.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actions::{Action, ActionInput, ActionRegistry, TriggerName};
use crate::config::{RuntimeConfig, TimerConfig, WatchFileConfig};
use crate::event::EventType;
use crate::filewatch::{FileStatus, FileWatcher};
use crate::notify::{NotificationQueue, Request, Route};

/// Periodic liveness report (ticker + channel).
pub const HEARTBEAT_ACTION: &str = "heartbeat";

/// Logs the status of every watched file (channel only).
pub const FILE_STATUS_ACTION: &str = "file-watcher-status";

/// Adds a file watch at runtime. Args: `[path, regex, skip?]` (channel only).
pub const ADD_WATCHER_ACTION: &str = "add-file-watcher";

/// Asks the application to reload its configuration. Args: `[reason?]` (channel only).
pub const RELOAD_ACTION: &str = "reload";

/// Sending side of the application's reload channel.
///
/// Holds at most one pending request; further requests while one is pending
/// are folded into it.
#[derive(Debug, Clone)]
pub struct ReloadHandle {
    tx: mpsc::Sender<String>,
}

impl ReloadHandle {
    /// Create the handle and the receiver the application waits on.
    pub fn channel() -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Request a reload. Returns `false` if nobody listens any more.
    pub fn reload(&self, reason: impl Into<String>) -> bool {
        match self.tx.try_send(reason.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(reason)) => {
                debug!(reason = %reason, "Reload already pending");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Body of a heartbeat request.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub version: &'static str,
    pub uptime_secs: u64,
    pub active_files: usize,
    pub files: Vec<FileStatus>,
}

/// Body of a custom timer request.
#[derive(Debug, Clone, Serialize)]
pub struct TimerFired {
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

/// Owns the action registry and the file watcher.
pub struct Engine {
    actions: ActionRegistry,
    watcher: Arc<FileWatcher>,
    files: Vec<WatchFileConfig>,
    queue: NotificationQueue,
    reload: Arc<OnceLock<ReloadHandle>>,
    started: Instant,
}

impl Engine {
    /// Build the engine and register its actions. Nothing runs until [`Engine::start`].
    pub async fn new(config: RuntimeConfig, queue: NotificationQueue) -> Self {
        let started = Instant::now();
        let watcher = Arc::new(FileWatcher::new(config.watcher, queue.clone()));
        let actions = ActionRegistry::new();
        let reload = Arc::new(OnceLock::new());

        let mut builtin = vec![
            file_status_action(Arc::clone(&watcher)),
            add_watcher_action(Arc::clone(&watcher)),
            reload_action(Arc::clone(&reload)),
        ];
        if let Some(period) = config.heartbeat {
            builtin.push(heartbeat_action(
                period,
                Arc::clone(&watcher),
                queue.clone(),
                started,
            ));
        }
        actions.add(builtin).await;
        actions
            .add(
                config
                    .timers
                    .into_iter()
                    .map(|timer| timer_action(timer, queue.clone())),
            )
            .await;

        Self {
            actions,
            watcher,
            files: config.files,
            queue,
            reload,
            started,
        }
    }

    /// Build the engine that replaces this one after a reload.
    ///
    /// Shares the notification queue and the reload channel. Nothing runs
    /// until [`Engine::start`]; stop this engine first.
    pub async fn rebuild(&self, config: RuntimeConfig) -> Engine {
        let next = Engine::new(config, self.queue.clone()).await;
        if let Some(handle) = self.reload.get() {
            next.set_reload_handle(handle.clone());
        }
        next
    }

    /// Connect the engine to the application's reload channel.
    pub fn set_reload_handle(&self, handle: ReloadHandle) {
        if self.reload.set(handle).is_err() {
            warn!("Reload channel already set, keeping the first one");
        }
    }

    /// Ask the application to reload.
    ///
    /// # Panics
    ///
    /// Panics if no reload channel was set.
    pub fn request_reload(&self, reason: impl Into<String>) {
        request_reload(&self.reload, reason.into());
    }

    /// Start watching the configured files and running the actions.
    ///
    /// # Panics
    ///
    /// Panics if already running.
    pub fn start(&self) {
        self.watcher.start(self.files.iter().cloned());
        self.actions.start();
        info!(
            actions = self.actions.names().len(),
            files = self.files.len(),
            "Engine started"
        );
    }

    /// Stop the actions (draining running invocations), then the watcher.
    ///
    /// # Panics
    ///
    /// Panics if not running.
    pub async fn stop(&self, event: EventType) {
        self.actions.stop(event).await;
        self.watcher.stop().await;
        info!(
            event = %event,
            uptime_secs = self.started.elapsed().as_secs(),
            "Engine stopped"
        );
    }

    /// Fire a channel-driven action by name.
    pub async fn exec(&self, input: ActionInput, name: &str) -> bool {
        self.actions.exec(input, name).await
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn watcher(&self) -> &FileWatcher {
        &self.watcher
    }

    /// Names of the registered actions.
    pub fn action_names(&self) -> Vec<TriggerName> {
        self.actions.names()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("actions", &self.actions)
            .field("watcher", &self.watcher)
            .finish()
    }
}

fn heartbeat_action(
    period: Duration,
    watcher: Arc<FileWatcher>,
    queue: NotificationQueue,
    started: Instant,
) -> Action {
    Action::new(HEARTBEAT_ACTION, move |_ctx, input: ActionInput| {
        let watcher = Arc::clone(&watcher);
        let queue = queue.clone();
        async move {
            let uptime = started.elapsed();
            metrics::gauge!("trigwatch_uptime_seconds").set(uptime.as_secs_f64());

            let heartbeat = Heartbeat {
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: uptime.as_secs(),
                active_files: watcher.active(),
                files: watcher.status(),
            };
            match Request::new(Route::Heartbeat, input.event, &heartbeat) {
                Ok(request) => queue.send_data(request),
                Err(e) => warn!(error = %e, "Failed to encode heartbeat"),
            }
        }
    })
    .with_ticker(period)
    .with_channel()
    .hidden()
}

fn file_status_action(watcher: Arc<FileWatcher>) -> Action {
    Action::new(FILE_STATUS_ACTION, move |_ctx, _input| {
        let watcher = Arc::clone(&watcher);
        async move {
            let files = watcher.status();
            info!(
                files = files.len(),
                active = watcher.active(),
                "File watcher status"
            );
            for file in files {
                info!(
                    path = %file.path,
                    active = file.active,
                    retries = file.retries,
                    lines = file.stats.lines,
                    bytes = file.stats.bytes,
                    matched = file.stats.matched,
                    skipped = file.stats.skipped,
                    dropped = file.stats.dropped,
                    errors = file.stats.errors,
                    restarts = file.stats.restarts,
                    "Watched file"
                );
            }
        }
    })
    .with_channel()
}

fn add_watcher_action(watcher: Arc<FileWatcher>) -> Action {
    Action::new(ADD_WATCHER_ACTION, move |_ctx, input: ActionInput| {
        let watcher = Arc::clone(&watcher);
        async move {
            let Some(config) = watch_config_from_args(&input.args) else {
                warn!(args = ?input.args, "add-file-watcher expects [path, regex, skip?]");
                return;
            };
            let path = config.path.clone();
            if let Err(e) = watcher.add_watcher(config).await {
                warn!(path = %path, error = %e, "Failed to add file watch");
            }
        }
    })
    .with_channel()
}

fn reload_action(reload: Arc<OnceLock<ReloadHandle>>) -> Action {
    Action::new(RELOAD_ACTION, move |_ctx, input: ActionInput| {
        let reload = Arc::clone(&reload);
        async move {
            let reason = match input.args.first() {
                Some(reason) => reason.clone(),
                None => format!("{} action", input.event),
            };
            request_reload(&reload, reason);
        }
    })
    .with_channel()
}

fn request_reload(reload: &OnceLock<ReloadHandle>, reason: String) {
    let Some(handle) = reload.get() else {
        panic!("reload requested with no reload channel");
    };
    info!(reason = %reason, "Reload requested");
    if !handle.reload(reason) {
        warn!("Reload channel closed, request ignored");
    }
}

fn watch_config_from_args(args: &[String]) -> Option<WatchFileConfig> {
    let [path, regex, rest @ ..] = args else {
        return None;
    };
    let mut config = WatchFileConfig::new(path.as_str(), regex.as_str());
    if let Some(skip) = rest.first().filter(|s| !s.is_empty()) {
        config = config.with_skip(skip.as_str());
    }
    Some(config)
}

fn timer_action(timer: TimerConfig, queue: NotificationQueue) -> Action {
    let TimerConfig { name, interval } = timer;
    Action::new(name.clone(), move |_ctx, input: ActionInput| {
        let queue = queue.clone();
        let fired = TimerFired {
            name: name.clone(),
            interval,
        };
        async move {
            let message = format!("Timer fired: {}", fired.name);
            match Request::new(Route::Timer, input.event, &fired) {
                Ok(request) => queue.send_data(request.with_log_message(message)),
                Err(e) => warn!(timer = %fired.name, error = %e, "Failed to encode timer"),
            }
        }
    })
    .with_ticker(interval)
    .with_channel()
}
