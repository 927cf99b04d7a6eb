//! A single watched file: patterns, tail handle, retry state and statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::tail::{Tail, TailOptions};
use crate::config::WatchFileConfig;
use crate::error::{TailError, WatchError};
use crate::limiter::LeakyBucket;

/// A line that passed the match pattern, the skip pattern and the limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    pub file: String,
    pub line: String,
    /// Every non-overlapping match of the pattern in the line.
    pub matches: Vec<String>,
}

/// What happened to one line read from a tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Empty, or no match.
    Ignored,
    /// Matched, but also matched the skip pattern.
    Skipped,
    /// Matched, but the limiter had no token left.
    Dropped,
    Matched(Match),
}

#[derive(Debug)]
struct Matcher {
    regex: Regex,
    skip: Option<Regex>,
}

#[derive(Debug, Default)]
struct FileState {
    matcher: Option<Matcher>,
    /// Present iff the file is actively tailed.
    tail: Option<Tail>,
    retries: u32,
}

/// Per-file counters, mirrored to `trigwatch_file_*_total{path}`.
#[derive(Debug, Default)]
struct FileStats {
    lines: AtomicU64,
    bytes: AtomicU64,
    matched: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    restarts: AtomicU64,
}

/// Point-in-time copy of a file's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileStatsSnapshot {
    pub lines: u64,
    pub bytes: u64,
    pub matched: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub errors: u64,
    pub retries: u64,
    pub restarts: u64,
}

/// Status line reported by the heartbeat and the status action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    pub path: String,
    pub active: bool,
    pub retries: u32,
    pub stats: FileStatsSnapshot,
}

/// A file the watcher tails.
#[derive(Debug)]
pub struct WatchFile {
    config: WatchFileConfig,
    state: RwLock<FileState>,
    stats: FileStats,
}

impl WatchFile {
    pub fn new(config: WatchFileConfig) -> Self {
        Self {
            config,
            state: RwLock::new(FileState::default()),
            stats: FileStats::default(),
        }
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    pub fn config(&self) -> &WatchFileConfig {
        &self.config
    }

    /// Compile the patterns and open the tail at end-of-file.
    ///
    /// Replaces any running tail. On failure the error is counted and the
    /// file stays inactive.
    ///
    /// # Errors
    /// Returns [`WatchError`] when a pattern is missing or invalid, or the
    /// tail cannot be opened.
    pub fn setup(&self) -> Result<mpsc::Receiver<String>, WatchError> {
        let mut state = self.write_state();
        self.setup_locked(&mut state)
    }

    fn setup_locked(&self, state: &mut FileState) -> Result<mpsc::Receiver<String>, WatchError> {
        if let Some(tail) = state.tail.take()
            && let Err(err) = tail.stop()
        {
            debug!(path = %self.config.path, error = %err, "Replaced tail had died");
        }

        let result = self.compile().and_then(|matcher| {
            let (tail, rx) =
                Tail::open(&self.config.path, self.tail_options()).map_err(|source| {
                    WatchError::Tail {
                        path: self.config.path.clone(),
                        source,
                    }
                })?;
            Ok((matcher, tail, rx))
        });

        match result {
            Ok((matcher, tail, rx)) => {
                state.matcher = Some(matcher);
                state.tail = Some(tail);
                debug!(path = %self.config.path, "Watching file");
                Ok(rx)
            }
            Err(err) => {
                self.record_error();
                Err(err)
            }
        }
    }

    fn compile(&self) -> Result<Matcher, WatchError> {
        let path = &self.config.path;
        if self.config.regex.is_empty() {
            return Err(WatchError::MissingRegex { path: path.clone() });
        }
        let regex = Regex::new(&self.config.regex).map_err(|e| WatchError::InvalidRegex {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let skip = match self.config.skip.as_deref() {
            None | Some("") => None,
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| WatchError::InvalidSkip {
                path: path.clone(),
                message: e.to_string(),
            })?),
        };
        Ok(Matcher { regex, skip })
    }

    fn tail_options(&self) -> TailOptions {
        TailOptions {
            poll: self.config.poll,
            pipe: self.config.pipe,
            must_exist: self.config.must_exist,
        }
    }

    pub fn is_active(&self) -> bool {
        self.read_state().tail.is_some()
    }

    pub fn retries(&self) -> u32 {
        self.read_state().retries
    }

    /// Drop the tail handle. Returns the tail's death reason, if it died.
    pub fn deactivate(&self) -> Option<TailError> {
        let tail = self.write_state().tail.take()?;
        tail.stop().err()
    }

    /// Stop tailing and mark the file non-restartable.
    pub fn stop(&self, max_retries: u32) {
        let mut state = self.write_state();
        state.retries = max_retries;
        if let Some(tail) = state.tail.take()
            && let Err(err) = tail.stop()
        {
            debug!(path = %self.config.path, error = %err, "Tail had already died");
        }
    }

    /// Exclude the file from automatic retries.
    pub fn park(&self, max_retries: u32) {
        self.write_state().retries = max_retries;
    }

    /// One maintenance retry. Returns the new line channel on success.
    ///
    /// Active files and files at the retry bound are left alone.
    pub fn retry(&self, max_retries: u32) -> Option<mpsc::Receiver<String>> {
        let mut state = self.write_state();
        if state.tail.is_some() || state.retries >= max_retries {
            return None;
        }

        state.retries += 1;
        self.stats.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("trigwatch_file_retries_total", "path" => self.config.path.clone())
            .increment(1);

        match self.setup_locked(&mut state) {
            Ok(rx) => {
                state.retries = 0;
                self.stats.restarts.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("trigwatch_file_restarts_total", "path" => self.config.path.clone())
                    .increment(1);
                info!(path = %self.config.path, "File watch restarted");
                Some(rx)
            }
            Err(err) => {
                warn!(
                    path = %self.config.path,
                    attempt = state.retries,
                    max_retries = max_retries,
                    error = %err,
                    "File watch retry failed"
                );
                None
            }
        }
    }

    /// Count an error against this file.
    pub fn record_error(&self) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("trigwatch_file_errors_total", "path" => self.config.path.clone())
            .increment(1);
    }

    /// Classify one line, updating counters and drawing a limiter token for matches.
    pub fn check_line(&self, line: &str, limiter: &LeakyBucket) -> LineOutcome {
        let path = &self.config.path;
        self.stats.lines.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(line.len() as u64, Ordering::Relaxed);
        metrics::counter!("trigwatch_file_lines_total", "path" => path.clone()).increment(1);

        if line.trim().is_empty() {
            return LineOutcome::Ignored;
        }

        let state = self.read_state();
        let Some(matcher) = &state.matcher else {
            return LineOutcome::Ignored;
        };
        if !matcher.regex.is_match(line) {
            return LineOutcome::Ignored;
        }

        if let Some(skip) = &matcher.skip
            && skip.is_match(line)
        {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("trigwatch_file_skipped_total", "path" => path.clone()).increment(1);
            return LineOutcome::Skipped;
        }

        self.stats.matched.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("trigwatch_file_matched_total", "path" => path.clone()).increment(1);

        if !limiter.pour(1) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("trigwatch_file_dropped_total", "path" => path.clone()).increment(1);
            return LineOutcome::Dropped;
        }

        LineOutcome::Matched(Match {
            file: path.clone(),
            line: line.trim().to_string(),
            matches: matcher
                .regex
                .find_iter(line)
                .map(|m| m.as_str().to_string())
                .collect(),
        })
    }

    pub fn stats(&self) -> FileStatsSnapshot {
        let s = &self.stats;
        FileStatsSnapshot {
            lines: s.lines.load(Ordering::Relaxed),
            bytes: s.bytes.load(Ordering::Relaxed),
            matched: s.matched.load(Ordering::Relaxed),
            skipped: s.skipped.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
            errors: s.errors.load(Ordering::Relaxed),
            retries: s.retries.load(Ordering::Relaxed),
            restarts: s.restarts.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> FileStatus {
        let state = self.read_state();
        FileStatus {
            path: self.config.path.clone(),
            active: state.tail.is_some(),
            retries: state.retries,
            stats: self.stats(),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, FileState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, FileState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for WatchFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.config.path)
    }
}
