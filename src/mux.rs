//! Dynamic multiplexer: one dispatch loop over a changing set of sources.
//!
//! A [`Multiplexer`] owns two reserved inputs, a control-add channel and a
//! maintenance ticker, plus any number of data sources. Sources can join at
//! any time (through the control-add channel or as the result of a
//! maintenance tick) and leave when their stream ends, without restarting the
//! waits on unrelated sources.
//!
//! # Architecture
//!
//! ```text
//! add_tx ──► control-add ─┐
//! ticker ─────────────────┤
//! source 1 ──(id, data)───┤──► select ──► Handler::{on_data, on_remove, on_tick}
//! source n ──(id, data)───┘
//! ```
//!
//! Each data stream is tagged with an internal id and terminated by a
//! `(id, None)` marker, so closure is observed exactly once. Streams are
//! merged with `SelectAll`: pushing is O(1) and exhausted streams drop out on
//! their own. The id to key map is the only bookkeeping, and it is touched
//! only from the loop task.
//!
//! # Shutdown
//!
//! Closing the control-add channel and every data source drains the loop to
//! termination. A handler may also end the loop early by returning
//! [`ControlFlow::Break`] from `on_data`. Either way the spawned task
//! completes and [`MuxHandle::join`] hands the handler back.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future;
use futures_util::stream::{self, BoxStream, SelectAll, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

/// Capacity of the control-add channel.
pub const ADD_CHANNEL_CAPACITY: usize = 1;

/// A data source and the bookkeeping entry it is dispatched with.
pub struct Source<K, D> {
    key: K,
    stream: BoxStream<'static, D>,
}

impl<K, D: Send + 'static> Source<K, D> {
    /// Wrap any stream as a source.
    pub fn new<S>(key: K, stream: S) -> Self
    where
        S: Stream<Item = D> + Send + 'static,
    {
        Self {
            key,
            stream: stream.boxed(),
        }
    }

    /// Wrap a channel receiver; the source closes when every sender is dropped.
    pub fn from_receiver(key: K, rx: mpsc::Receiver<D>) -> Self {
        Self::new(key, ReceiverStream::new(rx))
    }

    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: std::fmt::Debug, D> std::fmt::Debug for Source<K, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source").field("key", &self.key).finish()
    }
}

/// Sender half of a multiplexer's control-add channel.
pub type SourceSender<K, D> = mpsc::Sender<Source<K, D>>;

/// Callbacks invoked by the dispatch loop.
///
/// All callbacks run on the loop task. A panic in any of them is caught and
/// logged; the loop keeps running.
pub trait Handler: Send + 'static {
    /// Bookkeeping entry paired with each source.
    type Key: Display + Send + 'static;
    /// Values produced by the sources.
    type Data: Send + 'static;

    /// A value arrived on the source identified by `key`.
    fn on_data(&mut self, key: &Self::Key, data: Self::Data) -> ControlFlow<()>;

    /// The source identified by `key` closed and has been removed.
    fn on_remove(&mut self, key: Self::Key);

    /// The maintenance ticker fired. Returned sources join the active set.
    fn on_tick(&mut self) -> Vec<Source<Self::Key, Self::Data>>;
}

type Tagged<D> = BoxStream<'static, (u64, Option<D>)>;

enum Step<K, D> {
    Added(Source<K, D>),
    AddClosed,
    Tick,
    Data(u64, D),
    Closed(u64),
}

/// Dispatch loop over a dynamic set of sources.
pub struct Multiplexer<H: Handler> {
    name: &'static str,
    handler: H,
    add_rx: mpsc::Receiver<Source<H::Key, H::Data>>,
    tick_period: Duration,
    sources: SelectAll<Tagged<H::Data>>,
    entries: HashMap<u64, H::Key>,
    next_id: u64,
    active: Arc<AtomicUsize>,
}

impl<H: Handler> Multiplexer<H> {
    /// Create a loop and the sender for its control-add channel.
    ///
    /// `name` labels logs and the `trigwatch_mux_active_sources` gauge.
    pub fn new(
        name: &'static str,
        handler: H,
        tick_period: Duration,
    ) -> (Self, SourceSender<H::Key, H::Data>) {
        let (add_tx, add_rx) = mpsc::channel(ADD_CHANNEL_CAPACITY);

        let mux = Self {
            name,
            handler,
            add_rx,
            tick_period,
            sources: SelectAll::new(),
            entries: HashMap::new(),
            next_id: 0,
            active: Arc::new(AtomicUsize::new(0)),
        };

        (mux, add_tx)
    }

    /// Add an initial source before the loop starts.
    pub fn insert(&mut self, source: Source<H::Key, H::Data>) {
        let id = self.next_id;
        self.next_id += 1;

        let tagged = source
            .stream
            .map(move |data| (id, Some(data)))
            .chain(stream::once(future::ready((id, None))))
            .boxed();

        self.sources.push(tagged);
        self.entries.insert(id, source.key);
        self.publish_active();
    }

    /// Number of data sources currently in the active set.
    pub fn active(&self) -> usize {
        self.entries.len()
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> MuxHandle<H> {
        let active = Arc::clone(&self.active);
        let task = tokio::spawn(self.run());
        MuxHandle { task, active }
    }

    /// Run the loop until it drains, returning the handler.
    pub async fn run(mut self) -> H {
        let mut ticker = interval_at(Instant::now() + self.tick_period, self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut adding = true;

        info!(mux = self.name, sources = self.entries.len(), "Dispatch loop started");

        loop {
            if !adding && self.entries.is_empty() {
                break;
            }

            let step = tokio::select! {
                added = self.add_rx.recv(), if adding => match added {
                    Some(source) => Step::Added(source),
                    None => Step::AddClosed,
                },
                _ = ticker.tick() => Step::Tick,
                Some((id, event)) = self.sources.next(), if !self.sources.is_empty() => match event {
                    Some(data) => Step::Data(id, data),
                    None => Step::Closed(id),
                },
            };

            match step {
                Step::Added(source) => {
                    debug!(mux = self.name, source = %source.key, "Source added");
                    self.insert(source);
                }
                Step::AddClosed => {
                    debug!(
                        mux = self.name,
                        remaining = self.entries.len(),
                        "Control-add channel closed"
                    );
                    adding = false;
                }
                Step::Tick => {
                    let handler = &mut self.handler;
                    let revived = guarded(self.name, "tick", || handler.on_tick());
                    for source in revived.into_iter().flatten() {
                        self.insert(source);
                    }
                }
                Step::Data(id, data) => {
                    if self.dispatch(id, data).is_break() {
                        info!(mux = self.name, "Dispatch loop asked to stop");
                        break;
                    }
                }
                Step::Closed(id) => self.remove(id),
            }
        }

        // Drop remaining streams so their producers observe the close.
        self.sources.clear();
        self.entries.clear();
        self.publish_active();
        info!(mux = self.name, "Dispatch loop stopped");

        self.handler
    }

    fn dispatch(&mut self, id: u64, data: H::Data) -> ControlFlow<()> {
        let Some(key) = self.entries.get(&id) else {
            return ControlFlow::Continue(());
        };

        let handler = &mut self.handler;
        let name = self.name;
        match catch_unwind(AssertUnwindSafe(|| handler.on_data(key, data))) {
            Ok(flow) => flow,
            Err(panic) => {
                error!(
                    mux = name,
                    source = %key,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked on data, continuing"
                );
                metrics::counter!("trigwatch_mux_panics_total", "mux" => name).increment(1);
                ControlFlow::Continue(())
            }
        }
    }

    fn remove(&mut self, id: u64) {
        let Some(key) = self.entries.remove(&id) else {
            return;
        };
        self.publish_active();

        debug!(mux = self.name, source = %key, "Source closed");
        let handler = &mut self.handler;
        guarded(self.name, "remove", move || handler.on_remove(key));
    }

    fn publish_active(&self) {
        let count = self.entries.len();
        self.active.store(count, Ordering::SeqCst);
        metrics::gauge!("trigwatch_mux_active_sources", "mux" => self.name).set(count as f64);
    }
}

impl<H: Handler> std::fmt::Debug for Multiplexer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("name", &self.name)
            .field("active", &self.entries.len())
            .field("tick_period", &self.tick_period)
            .finish()
    }
}

/// Handle to a spawned dispatch loop.
pub struct MuxHandle<H: Handler> {
    task: JoinHandle<H>,
    active: Arc<AtomicUsize>,
}

impl<H: Handler> MuxHandle<H> {
    /// Number of data sources in the active set, as last published by the loop.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to drain and take back its handler.
    pub async fn join(self) -> Result<H, JoinError> {
        self.task.await
    }
}

impl<H: Handler> std::fmt::Debug for MuxHandle<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxHandle")
            .field("active", &self.active())
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn guarded<T>(mux: &'static str, callback: &'static str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            error!(
                mux = mux,
                callback = callback,
                panic = %panic_message(panic.as_ref()),
                "Handler panicked, continuing"
            );
            metrics::counter!("trigwatch_mux_panics_total", "mux" => mux).increment(1);
            None
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
