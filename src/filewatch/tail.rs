//! Async file follower producing complete lines.
//!
//! A [`Tail`] starts at end-of-file and follows the path across rotations
//! (inode change) and truncations. Lines are delivered on a bounded channel;
//! the channel closes when the tail stops or dies, and the death reason is
//! kept for [`Tail::stop`] to report.
//!
//! Wake-ups come from filesystem events (`notify`) with a slow polling
//! fallback, or from fixed polling when `poll` is set. Named pipes are opened
//! without blocking, never seeked, and reopened whenever the writer side
//! closes.

use std::fs::Metadata;
use std::io::{ErrorKind, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
#[cfg(unix)]
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TailError;

/// Interval used when `poll` is set.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Safety-net interval when waking on filesystem events.
const EVENT_FALLBACK_INTERVAL: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8 * 1024;

/// Buffered lines per tail before the reader waits on the dispatcher.
const LINE_CHANNEL_CAPACITY: usize = 64;

/// Unterminated data beyond this size is flushed as a line.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// How a path is followed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailOptions {
    /// Poll at a fixed interval instead of waking on filesystem events.
    pub poll: bool,
    /// The path is a named pipe.
    pub pipe: bool,
    /// Fail instead of waiting when the path does not exist.
    pub must_exist: bool,
}

/// Handle to a running follower task.
#[derive(Debug)]
pub struct Tail {
    cancel: CancellationToken,
    death: Arc<Mutex<Option<TailError>>>,
}

impl Tail {
    /// Start following `path` at end-of-file.
    ///
    /// Returns the handle and the receiving side of the line channel. Must be
    /// called from within a tokio runtime.
    pub fn open(
        path: &str,
        options: TailOptions,
    ) -> Result<(Self, mpsc::Receiver<String>), TailError> {
        let initial = if options.pipe {
            if options.must_exist && !Path::new(path).exists() {
                return Err(TailError::NotFound(path.to_string()));
            }
            None
        } else {
            open_at_end(path, options.must_exist)?
        };

        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let death = Arc::new(Mutex::new(None));

        let (events, wake) = if options.poll || options.pipe {
            (None, None)
        } else {
            match fs_events(Path::new(path)) {
                Some((watcher, wake)) => (Some(watcher), Some(wake)),
                None => (None, None),
            }
        };

        let mut follower = Follower {
            path: PathBuf::from(path),
            display: path.to_string(),
            options,
            tx,
            cancel: cancel.clone(),
            buffer: LineBuffer::new(),
            file: None,
            pos: 0,
            id: None,
            _events: events,
            wake,
        };
        if let Some((file, pos, id)) = initial {
            follower.file = Some(Reader::File(file));
            follower.pos = pos;
            follower.id = id;
        }

        let recorded = Arc::clone(&death);
        tokio::spawn(async move {
            match follower.follow().await {
                Ok(()) => debug!(path = %follower.display, "Tail stopped"),
                Err(err) => {
                    warn!(path = %follower.display, error = %err, "Tail died");
                    *recorded.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                }
            }
            // Dropping the follower closes the line channel after the death is recorded.
            drop(follower);
        });

        Ok((Self { cancel, death }, rx))
    }

    /// Stop following. Returns the reason if the tail had already died.
    pub fn stop(self) -> Result<(), TailError> {
        self.cancel.cancel();
        match self
            .death
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for Tail {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn open_at_end(
    path: &str,
    must_exist: bool,
) -> Result<Option<(File, u64, Option<u64>)>, TailError> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            if must_exist {
                return Err(TailError::NotFound(path.to_string()));
            }
            info!(path = %path, "File does not exist yet, waiting for it");
            return Ok(None);
        }
        Err(err) => return Err(TailError::io(path, &err)),
    };

    let meta = file.metadata().map_err(|e| TailError::io(path, &e))?;
    let pos = file
        .seek(SeekFrom::End(0))
        .map_err(|e| TailError::io(path, &e))?;

    Ok(Some((File::from_std(file), pos, file_id(&meta))))
}

#[cfg(unix)]
fn file_id(meta: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &Metadata) -> Option<u64> {
    None
}

/// Watch the parent directory so creation and rotation of `path` also wake us.
fn fs_events(path: &Path) -> Option<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let (tx, rx) = mpsc::channel(1);
    let name = path.file_name().map(|n| n.to_os_string());

    let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res
            && event.paths.iter().any(|p| p.file_name() == name.as_deref())
        {
            let _ = tx.try_send(());
        }
    });

    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Filesystem events unavailable, polling");
            return None;
        }
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!(path = %path.display(), error = %err, "Cannot watch directory, polling");
        return None;
    }

    Some((watcher, rx))
}

/// The open end of a followed path.
enum Reader {
    File(File),
    #[cfg(unix)]
    Pipe(pipe::Receiver),
}

impl Reader {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Reader::File(file) => file.read(buf).await,
            #[cfg(unix)]
            Reader::Pipe(rx) => rx.read(buf).await,
        }
    }
}

struct Follower {
    path: PathBuf,
    display: String,
    options: TailOptions,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    buffer: LineBuffer,
    file: Option<Reader>,
    pos: u64,
    id: Option<u64>,
    _events: Option<RecommendedWatcher>,
    wake: Option<mpsc::Receiver<()>>,
}

impl Follower {
    /// Returns `Ok` when cancelled or when the line receiver is gone.
    async fn follow(&mut self) -> Result<(), TailError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let cancel = self.cancel.clone();

        loop {
            if self.file.is_none() {
                let opened = if self.options.pipe {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        opened = self.open_pipe() => opened?,
                    }
                } else {
                    self.open_current().await?
                };
                if !opened && self.options.must_exist {
                    return Err(TailError::NotFound(self.display.clone()));
                }
            }

            if self.file.is_some() {
                if !self.read_available(&mut chunk).await? {
                    return Ok(());
                }
                if self.options.pipe {
                    // Writer closed the pipe; reopen after the next wait.
                    self.file = None;
                } else if !self.check_rotation(&mut chunk).await? {
                    return Ok(());
                }
            }

            let interval = if self.options.poll {
                POLL_INTERVAL
            } else if self.wake.is_some() {
                EVENT_FALLBACK_INTERVAL
            } else {
                // Events unavailable: fall back to regular polling.
                POLL_INTERVAL
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = wait(&mut self.wake, interval) => {}
            }
        }
    }

    /// Open the path from the start. Returns `false` if it does not exist.
    async fn open_current(&mut self) -> Result<bool, TailError> {
        match File::open(&self.path).await {
            Ok(file) => {
                let meta = file
                    .metadata()
                    .await
                    .map_err(|e| TailError::io(&self.display, &e))?;
                debug!(path = %self.display, "Opened file from start");
                self.id = file_id(&meta);
                self.pos = 0;
                self.file = Some(Reader::File(file));
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(TailError::io(&self.display, &err)),
        }
    }

    async fn open_pipe(&mut self) -> Result<bool, TailError> {
        match self.open_pipe_reader().await {
            Ok(reader) => {
                self.file = Some(reader);
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if !self.options.must_exist {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Ok(false)
            }
            Err(err) => Err(TailError::io(&self.display, &err)),
        }
    }

    /// The read end never waits for a writer to appear.
    #[cfg(unix)]
    async fn open_pipe_reader(&self) -> std::io::Result<Reader> {
        pipe::OpenOptions::new()
            .open_receiver(&self.path)
            .map(Reader::Pipe)
    }

    #[cfg(not(unix))]
    async fn open_pipe_reader(&self) -> std::io::Result<Reader> {
        File::open(&self.path).await.map(Reader::File)
    }

    /// Read to EOF, sending complete lines.
    ///
    /// Returns `false` if cancelled or the receiver is gone.
    async fn read_available(&mut self, chunk: &mut [u8]) -> Result<bool, TailError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(true);
        };

        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(false),
                read = file.read(chunk) => read.map_err(|e| TailError::io(&self.display, &e))?,
            };
            if n == 0 {
                return Ok(true);
            }
            self.pos += n as u64;
            self.buffer.push(&chunk[..n]);

            for line in self.buffer.drain_complete_lines() {
                if !send_line(&self.tx, &self.cancel, line).await {
                    return Ok(false);
                }
            }
        }
    }

    /// Reopen on rotation, seek back on truncation.
    ///
    /// Returns `false` if cancelled or the receiver is gone.
    async fn check_rotation(&mut self, chunk: &mut [u8]) -> Result<bool, TailError> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if self.options.must_exist {
                    return Err(TailError::NotFound(self.display.clone()));
                }
                // Removed: keep the old handle until a new file shows up.
                return Ok(true);
            }
            Err(err) => return Err(TailError::io(&self.display, &err)),
        };

        let id = file_id(&meta);
        if id.is_some() && self.id.is_some() && id != self.id {
            info!(path = %self.display, "File rotated, reopening");
            // Finish the rotated file before switching.
            if !self.read_available(chunk).await? {
                return Ok(false);
            }
            if let Some(line) = self.buffer.take_pending()
                && !send_line(&self.tx, &self.cancel, line).await
            {
                return Ok(false);
            }
            self.file = None;
            self.open_current().await?;
            return Ok(true);
        }

        if meta.len() < self.pos
            && let Some(Reader::File(file)) = self.file.as_mut()
        {
            info!(path = %self.display, "File truncated, reading from start");
            file.seek(SeekFrom::Start(0))
                .await
                .map_err(|e| TailError::io(&self.display, &e))?;
            self.pos = 0;
            self.buffer.clear();
        }

        Ok(true)
    }
}

/// Returns `false` if cancelled or the receiver is gone.
async fn send_line(tx: &mpsc::Sender<String>, cancel: &CancellationToken, line: String) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(line) => sent.is_ok(),
    }
}

async fn wait(wake: &mut Option<mpsc::Receiver<()>>, interval: Duration) {
    let Some(rx) = wake.as_mut() else {
        tokio::time::sleep(interval).await;
        return;
    };

    if let Ok(None) = tokio::time::timeout(interval, rx.recv()).await {
        // Event source gone; poll from now on.
        *wake = None;
    }
}

/// Line assembler for raw file chunks.
///
/// Only newline-terminated lines are emitted; the trailing `\r` of CRLF
/// endings is removed. Invalid UTF-8 is replaced rather than rejected, since a
/// log line is still worth matching when one byte is corrupt.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Drain every complete line. A newline is ASCII, so splitting on it
    /// never cuts a multi-byte character.
    pub(crate) fn drain_complete_lines(&mut self) -> Vec<String> {
        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_PENDING_BYTES {
                warn!(bytes = self.buffer.len(), "Unterminated line too long, flushing");
                let pending = std::mem::take(&mut self.buffer);
                return vec![decode(&pending)];
            }
            return Vec::new();
        };

        let complete: Vec<u8> = self.buffer.drain(..=last_newline).collect();
        complete[..last_newline]
            .split(|&b| b == b'\n')
            .map(decode)
            .collect()
    }

    /// Take the unterminated remainder, if any.
    pub(crate) fn take_pending(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut self.buffer);
        Some(decode(&pending))
    }

    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn decode(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
