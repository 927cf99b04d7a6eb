//! File tail watcher: many tails on one dispatch loop.
//!
//! Every active [`WatchFile`] contributes its tail's line channel as a source
//! on a [`Multiplexer`]. Lines are filtered by the file's patterns and the
//! shared [`LeakyBucket`]; survivors are enqueued on the notification queue.
//! When a tail's channel closes the file is deactivated, and the maintenance
//! tick retries inactive files up to `max_retries` times.

mod file;
mod tail;

pub use file::{FileStatsSnapshot, FileStatus, LineOutcome, Match, WatchFile};
pub use tail::{Tail, TailOptions};

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::config::{WatchFileConfig, WatcherSettings};
use crate::error::WatchError;
use crate::event::EventType;
use crate::limiter::LeakyBucket;
use crate::mux::{Handler, Multiplexer, MuxHandle, Source, SourceSender};
use crate::notify::{NotificationQueue, Request, Route};

type FileList = Arc<RwLock<Vec<Arc<WatchFile>>>>;

/// Loop-side state of the watcher.
struct LineHandler {
    files: FileList,
    limiter: Arc<LeakyBucket>,
    queue: NotificationQueue,
    max_retries: u32,
}

impl LineHandler {
    fn forward(&self, file: &WatchFile, found: Match) {
        let message = format!("Watched-File Line Match: {}: {}", file.path(), found.line);
        match Request::new(Route::LogLine, EventType::File, &found) {
            Ok(request) => self.queue.send_data(
                request
                    .with_log_payload(file.config().log_match)
                    .with_log_message(message),
            ),
            Err(e) => warn!(path = %file, error = %e, "Failed to encode match"),
        }
    }
}

impl Handler for LineHandler {
    type Key = Arc<WatchFile>;
    type Data = String;

    fn on_data(&mut self, file: &Arc<WatchFile>, line: String) -> ControlFlow<()> {
        if let LineOutcome::Matched(found) = file.check_line(&line, &self.limiter) {
            self.forward(file, found);
        }
        ControlFlow::Continue(())
    }

    fn on_remove(&mut self, file: Arc<WatchFile>) {
        match file.deactivate() {
            Some(err) => {
                warn!(path = %file, error = %err, "File watch died, will retry");
                file.record_error();
            }
            None => debug!(path = %file, "File watch closed"),
        }
    }

    fn on_tick(&mut self) -> Vec<Source<Arc<WatchFile>, String>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner).clone();
        files
            .into_iter()
            .filter_map(|file| {
                let rx = file.retry(self.max_retries)?;
                Some(Source::from_receiver(file, rx))
            })
            .collect()
    }
}

struct Running {
    add_tx: SourceSender<Arc<WatchFile>, String>,
    handle: MuxHandle<LineHandler>,
}

/// Watches a dynamic set of files and forwards matching lines.
pub struct FileWatcher {
    settings: WatcherSettings,
    queue: NotificationQueue,
    limiter: Arc<LeakyBucket>,
    files: FileList,
    running: Mutex<Option<Running>>,
}

impl FileWatcher {
    pub fn new(settings: WatcherSettings, queue: NotificationQueue) -> Self {
        Self {
            limiter: Arc::new(LeakyBucket::new(settings.burst, settings.refill)),
            settings,
            queue,
            files: Arc::new(RwLock::new(Vec::new())),
            running: Mutex::new(None),
        }
    }

    /// Set up every file and start the dispatch loop.
    ///
    /// Files that fail setup are logged and parked at the retry bound. Must
    /// be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if the watcher is already running.
    pub fn start(&self, configs: impl IntoIterator<Item = WatchFileConfig>) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(running.is_none(), "file watcher started while running");

        let handler = LineHandler {
            files: Arc::clone(&self.files),
            limiter: Arc::clone(&self.limiter),
            queue: self.queue.clone(),
            max_retries: self.settings.max_retries,
        };
        let (mut mux, add_tx) = Multiplexer::new("files", handler, self.settings.retry_interval);

        let mut files = Vec::new();
        for config in configs {
            let file = Arc::new(WatchFile::new(config));
            match file.setup() {
                Ok(rx) => mux.insert(Source::from_receiver(Arc::clone(&file), rx)),
                Err(err) => {
                    warn!(path = %file, error = %err, "File watch setup failed");
                    file.park(self.settings.max_retries);
                }
            }
            files.push(file);
        }

        info!(
            files = files.len(),
            active = mux.active(),
            "File watcher started"
        );
        *self.files.write().unwrap_or_else(PoisonError::into_inner) = files;
        *running = Some(Running {
            add_tx,
            handle: mux.spawn(),
        });
    }

    /// Start watching one more file while running.
    ///
    /// An inactive entry for the same path is replaced. A file that fails
    /// setup is still listed, parked at the retry bound.
    ///
    /// # Errors
    ///
    /// [`WatchError::NotRunning`] when stopped, [`WatchError::AlreadyWatching`]
    /// when the path is actively watched, or the setup error.
    pub async fn add_watcher(&self, config: WatchFileConfig) -> Result<Arc<WatchFile>, WatchError> {
        let add_tx = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.add_tx.clone())
            .ok_or(WatchError::NotRunning)?;

        let max_retries = self.settings.max_retries;
        let file = Arc::new(WatchFile::new(config));
        if self
            .files()
            .iter()
            .any(|f| f.path() == file.path() && f.is_active())
        {
            return Err(WatchError::AlreadyWatching {
                path: file.path().to_string(),
            });
        }

        let setup = file.setup();
        if setup.is_err() {
            file.park(max_retries);
        }
        {
            let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
            files.retain(|f| {
                if f.path() == file.path() {
                    f.stop(max_retries);
                    return false;
                }
                true
            });
            files.push(Arc::clone(&file));
        }
        let rx = setup?;

        if add_tx
            .send(Source::from_receiver(Arc::clone(&file), rx))
            .await
            .is_err()
        {
            file.stop(max_retries);
            return Err(WatchError::NotRunning);
        }

        info!(path = %file, "File watch added");
        Ok(file)
    }

    /// Stop every tail and wait for the loop to drain.
    ///
    /// # Panics
    ///
    /// Panics if the watcher is not running.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { add_tx, handle }) = running else {
            panic!("file watcher stopped while not running");
        };

        for file in self.files() {
            file.stop(self.settings.max_retries);
        }
        drop(add_tx);

        if let Err(join_error) = handle.join().await {
            warn!(error = %join_error, "File watch loop failed");
        }
        info!("File watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of tails currently on the loop.
    pub fn active(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |running| running.handle.active())
    }

    /// Snapshot of the watched files.
    pub fn files(&self) -> Vec<Arc<WatchFile>> {
        self.files.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn status(&self) -> Vec<FileStatus> {
        self.files().iter().map(|file| file.status()).collect()
    }

    pub fn settings(&self) -> WatcherSettings {
        self.settings
    }
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("settings", &self.settings)
            .field("files", &self.files().len())
            .field("running", &self.is_running())
            .finish()
    }
}
