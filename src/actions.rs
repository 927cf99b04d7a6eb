//! Action registry: named timers and triggers on one dispatch loop.
//!
//! Every [`Action`] is driven by an input channel, a ticker, or both. The
//! registry feeds all of them into a single [`Multiplexer`] together with a
//! reserved stop source. Each firing runs the action's callback on its own
//! task inside a `JoinSet`, so a panicking action is reported through its
//! `JoinError` and never takes the loop down.
//!
//! # Lifecycle
//!
//! ```text
//! add() ──► start() ──► exec() / ticks ──► stop(event)
//!                 ▲                              │
//!                 └──────── start() again ◄──────┘
//! ```
//!
//! Channels are created fresh on every `start`, so a registry can be stopped
//! and started again (for example around a configuration reload). Stopping
//! when not running is a bug in the caller and panics.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::event::EventType;
use crate::mux::{Handler, Multiplexer, MuxHandle, Source, SourceSender};

/// How often finished invocations are reaped.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of each action's input channel.
const ACTION_CHANNEL_CAPACITY: usize = 1;

/// Placeholder replaced by [`TriggerName::with_instance`].
const INSTANCE_PLACEHOLDER: &str = "{}";

/// Name of an action. May embed an instance placeholder (`{}`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TriggerName(Cow<'static, str>);

impl TriggerName {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Fill the instance placeholder, e.g. `"Check {} Status"` with `"plex"`.
    pub fn with_instance(&self, instance: impl fmt::Display) -> Self {
        Self(Cow::Owned(
            self.0.replace(INSTANCE_PLACEHOLDER, &instance.to_string()),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TriggerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for TriggerName {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for TriggerName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl AsRef<str> for TriggerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Value handed to an action when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionInput {
    pub event: EventType,
    pub args: Vec<String>,
}

impl ActionInput {
    pub fn new(event: EventType) -> Self {
        Self {
            event,
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-invocation context passed to action callbacks.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub name: TriggerName,
    /// Cancelled when the registry stops. Callbacks may observe it to finish early.
    pub shutdown: CancellationToken,
}

/// Boxed action callback.
pub type ActionFn = Arc<dyn Fn(ActionContext, ActionInput) -> BoxFuture<'static, ()> + Send + Sync>;

/// A named, triggerable unit of work.
pub struct Action {
    name: TriggerName,
    func: ActionFn,
    channel: bool,
    ticker: Option<Duration>,
    hidden: bool,
    sender: RwLock<Option<mpsc::Sender<ActionInput>>>,
}

impl Action {
    /// Create an action. Add a channel and/or a ticker before registering it.
    pub fn new<F, Fut>(name: impl Into<TriggerName>, func: F) -> Self
    where
        F: Fn(ActionContext, ActionInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            func: Arc::new(
                move |ctx: ActionContext, input: ActionInput| -> BoxFuture<'static, ()> {
                    Box::pin(func(ctx, input))
                },
            ),
            channel: false,
            ticker: None,
            hidden: false,
            sender: RwLock::new(None),
        }
    }

    /// Allow explicit invocation through [`ActionRegistry::exec`].
    pub fn with_channel(mut self) -> Self {
        self.channel = true;
        self
    }

    /// Fire every `period`, starting one full period after the registry starts.
    pub fn with_ticker(mut self, period: Duration) -> Self {
        self.ticker = Some(period);
        self
    }

    /// Fire without logging each invocation.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn name(&self) -> &TriggerName {
        &self.name
    }

    pub fn ticker(&self) -> Option<Duration> {
        self.ticker
    }

    pub fn has_channel(&self) -> bool {
        self.channel
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    fn sender(&self) -> Option<mpsc::Sender<ActionInput>> {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn close(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Build this action's sources, replacing any previous input channel.
    fn sources(self: &Arc<Self>) -> Vec<Source<Slot, ActionInput>> {
        let mut sources = Vec::with_capacity(2);

        if self.channel {
            let (tx, rx) = mpsc::channel(ACTION_CHANNEL_CAPACITY);
            *self.sender.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);
            sources.push(Source::from_receiver(Slot::Action(Arc::clone(self)), rx));
        }

        if let Some(period) = self.ticker {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let ticks = IntervalStream::new(ticker).map(|_| ActionInput::new(EventType::Schedule));
            sources.push(Source::new(Slot::Action(Arc::clone(self)), ticks));
        }

        sources
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("ticker", &self.ticker)
            .field("hidden", &self.hidden)
            .finish()
    }
}

/// Bookkeeping entry for each source on the registry's loop.
enum Slot {
    Action(Arc<Action>),
    Stop,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Action(action) => write!(f, "{}", action.name),
            Slot::Stop => f.write_str("<stop>"),
        }
    }
}

/// Loop-side state: spawns invocations and supervises them.
struct Dispatcher {
    invocations: JoinSet<()>,
    in_flight: HashMap<Id, (TriggerName, EventType)>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    fn new(shutdown: CancellationToken) -> Self {
        Self {
            invocations: JoinSet::new(),
            in_flight: HashMap::new(),
            shutdown,
        }
    }

    fn fire(&mut self, action: &Arc<Action>, input: ActionInput) {
        let event = input.event;
        let ctx = ActionContext {
            name: action.name.clone(),
            shutdown: self.shutdown.clone(),
        };

        if action.hidden {
            debug!(action = %action.name, event = %event, "Action fired");
        } else {
            info!(action = %action.name, event = %event, args = ?input.args, "Action fired");
        }
        metrics::counter!("trigwatch_action_runs_total", "action" => action.name.to_string())
            .increment(1);

        let handle = self.invocations.spawn((action.func)(ctx, input));
        self.in_flight.insert(handle.id(), (action.name.clone(), event));
    }

    fn finished(&mut self, result: Result<(Id, ()), JoinError>) {
        match result {
            Ok((id, ())) => {
                self.in_flight.remove(&id);
            }
            Err(join_error) => {
                let context = self.in_flight.remove(&join_error.id());
                if !join_error.is_panic() {
                    debug!(error = %join_error, "Action invocation cancelled");
                    return;
                }
                match context {
                    Some((name, event)) => {
                        error!(
                            action = %name,
                            event = %event,
                            error = %join_error,
                            "Action panicked - CRITICAL"
                        );
                        metrics::counter!(
                            "trigwatch_action_panics_total",
                            "action" => name.to_string()
                        )
                        .increment(1);
                    }
                    None => {
                        error!(error = %join_error, "Action panicked but context not found - CRITICAL");
                        metrics::counter!("trigwatch_action_panics_total", "action" => "unknown")
                            .increment(1);
                    }
                }
            }
        }
    }

    /// Wait for every in-flight invocation to finish.
    async fn drain(mut self) {
        if !self.in_flight.is_empty() {
            debug!(in_flight = self.in_flight.len(), "Waiting for running actions");
        }
        while let Some(result) = self.invocations.join_next_with_id().await {
            self.finished(result);
        }
    }
}

impl Handler for Dispatcher {
    type Key = Slot;
    type Data = ActionInput;

    fn on_data(&mut self, slot: &Slot, input: ActionInput) -> ControlFlow<()> {
        match slot {
            Slot::Action(action) => {
                self.fire(action, input);
                ControlFlow::Continue(())
            }
            Slot::Stop => {
                info!(event = %input.event, "Stopping actions");
                self.shutdown.cancel();
                ControlFlow::Break(())
            }
        }
    }

    fn on_remove(&mut self, slot: Slot) {
        debug!(source = %slot, "Action source closed");
    }

    fn on_tick(&mut self) -> Vec<Source<Slot, ActionInput>> {
        while let Some(result) = self.invocations.try_join_next_with_id() {
            self.finished(result);
        }
        Vec::new()
    }
}

struct Running {
    add_tx: SourceSender<Slot, ActionInput>,
    stop_tx: mpsc::Sender<ActionInput>,
    handle: MuxHandle<Dispatcher>,
}

/// Ordered list of actions plus the loop that drives them.
pub struct ActionRegistry {
    actions: RwLock<Vec<Arc<Action>>>,
    running: Mutex<Option<Running>>,
    reap_interval: Duration,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::with_reap_interval(DEFAULT_REAP_INTERVAL)
    }

    pub fn with_reap_interval(reap_interval: Duration) -> Self {
        Self {
            actions: RwLock::new(Vec::new()),
            running: Mutex::new(None),
            reap_interval,
        }
    }

    /// Register actions. While running, their sources join the live loop.
    ///
    /// # Panics
    ///
    /// Panics if an action has neither a channel nor a ticker.
    pub async fn add(&self, actions: impl IntoIterator<Item = Action>) {
        let added: Vec<Arc<Action>> = actions
            .into_iter()
            .map(|action| {
                assert!(
                    action.channel || action.ticker.is_some(),
                    "action '{}' has neither a channel nor a ticker",
                    action.name
                );
                Arc::new(action)
            })
            .collect();

        self.actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(added.iter().cloned());

        let add_tx = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.add_tx.clone());

        let Some(add_tx) = add_tx else {
            return;
        };

        for action in &added {
            for source in action.sources() {
                if add_tx.send(source).await.is_err() {
                    warn!(action = %action.name, "Action loop gone, source not added");
                }
            }
        }
    }

    /// Look up an action by exact name.
    pub fn get(&self, name: &str) -> Option<Arc<Action>> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|action| action.name.as_str() == name)
            .cloned()
    }

    /// Names of every registered action, in registration order.
    pub fn names(&self) -> Vec<TriggerName> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|action| action.name.clone())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Fire a channel-driven action.
    ///
    /// Returns `false` when the registry is stopped, the name is unknown, or
    /// the action has no channel. Waits while the action's buffer is full.
    pub async fn exec(&self, input: ActionInput, name: &str) -> bool {
        let Some(action) = self.get(name) else {
            debug!(action = %name, "Exec of unknown action");
            return false;
        };
        let Some(sender) = action.sender() else {
            return false;
        };
        sender.send(input).await.is_ok()
    }

    /// Start the dispatch loop. Must be called from within a tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if the registry is already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(running.is_none(), "action registry started while running");

        let shutdown = CancellationToken::new();
        let (mut mux, add_tx) =
            Multiplexer::new("actions", Dispatcher::new(shutdown), self.reap_interval);

        let (stop_tx, stop_rx) = mpsc::channel(1);
        mux.insert(Source::from_receiver(Slot::Stop, stop_rx));

        let actions = self.actions.read().unwrap_or_else(PoisonError::into_inner);
        for action in actions.iter() {
            for source in action.sources() {
                mux.insert(source);
            }
        }

        info!(actions = actions.len(), "Action registry started");
        *running = Some(Running {
            add_tx,
            stop_tx,
            handle: mux.spawn(),
        });
    }

    /// Stop the loop and wait for running actions to finish.
    ///
    /// # Panics
    ///
    /// Panics if the registry is not running.
    pub async fn stop(&self, event: EventType) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            panic!("action registry stopped while not running");
        };

        for action in self.actions.read().unwrap_or_else(PoisonError::into_inner).iter() {
            action.close();
        }

        let Running {
            add_tx,
            stop_tx,
            handle,
        } = running;
        drop(add_tx);
        if stop_tx.send(ActionInput::new(event)).await.is_err() {
            warn!("Action loop already gone before stop");
        }

        match handle.join().await {
            Ok(dispatcher) => dispatcher.drain().await,
            Err(join_error) => error!(error = %join_error, "Action loop failed"),
        }
        info!(event = %event, "Action registry stopped");
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counting(name: &'static str, count: &Arc<AtomicUsize>) -> Action {
        let count = Arc::clone(count);
        Action::new(name, move |_ctx, _input| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    fn explode() {
        panic!("action failure");
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while count.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("action did not run in time");
    }

    #[test]
    fn trigger_name_with_instance() {
        let name = TriggerName::from_static("Check {} Status");
        assert_eq!(name.with_instance("plex").as_str(), "Check plex Status");
        assert_eq!(name.with_instance(3).to_string(), "Check 3 Status");
        // No placeholder: unchanged.
        assert_eq!(TriggerName::new("plain").with_instance("x").as_str(), "plain");
    }

    #[test]
    fn action_input_builder() {
        let input = ActionInput::new(EventType::Api).with_args(["a", "b"]);
        assert_eq!(input.event, EventType::Api);
        assert_eq!(input.args, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_name() {
        let registry = ActionRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.add([counting("known", &count).with_channel()]).await;

        assert!(registry.get("known").is_some());
        assert!(registry.get("unknown").is_none());
        assert!(registry.get("Known").is_none());
    }

    #[tokio::test]
    async fn exec_runs_channel_action_with_args() {
        let registry = ActionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        registry
            .add([Action::new("echo", move |ctx, input| {
                let recorder = Arc::clone(&recorder);
                async move {
                    recorder.lock().unwrap().push((ctx.name.to_string(), input));
                }
            })
            .with_channel()])
            .await;
        registry.start();

        let input = ActionInput::new(EventType::User).with_args(["one"]);
        assert!(registry.exec(input.clone(), "echo").await);

        tokio::time::timeout(Duration::from_secs(2), async {
            while seen.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.lock().unwrap()[0], ("echo".to_string(), input));

        registry.stop(EventType::Stop).await;
    }

    #[tokio::test]
    async fn exec_returns_false_when_not_invocable() {
        let registry = ActionRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .add([
                counting("chan", &count).with_channel(),
                counting("tick-only", &count).with_ticker(Duration::from_secs(3600)),
            ])
            .await;

        // Before start.
        assert!(!registry.exec(ActionInput::new(EventType::User), "chan").await);

        registry.start();
        assert!(!registry.exec(ActionInput::new(EventType::User), "missing").await);
        assert!(!registry.exec(ActionInput::new(EventType::User), "tick-only").await);
        assert!(registry.exec(ActionInput::new(EventType::User), "chan").await);
        wait_for(&count, 1).await;

        registry.stop(EventType::Stop).await;
        assert!(!registry.exec(ActionInput::new(EventType::User), "chan").await);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_action_fires_three_times_in_three_and_a_half_seconds() {
        let registry = ActionRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .add([counting("svc-check", &count).with_ticker(Duration::from_secs(1))])
            .await;
        registry.start();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        registry.stop(EventType::Stop).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_does_not_fire_immediately() {
        let registry = ActionRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .add([counting("later", &count).with_ticker(Duration::from_secs(5))])
            .await;
        registry.start();

        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        registry.stop(EventType::Stop).await;
    }

    #[tokio::test]
    #[should_panic(expected = "action registry stopped while not running")]
    async fn double_stop_panics() {
        let registry = ActionRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.add([counting("a", &count).with_channel()]).await;
        registry.start();

        registry.stop(EventType::Stop).await;
        registry.stop(EventType::Stop).await;
    }

    #[tokio::test]
    #[should_panic(expected = "action registry stopped while not running")]
    async fn stop_before_start_panics() {
        ActionRegistry::new().stop(EventType::Stop).await;
    }

    #[tokio::test]
    #[should_panic(expected = "has neither a channel nor a ticker")]
    async fn action_without_channel_or_ticker_panics() {
        let count = Arc::new(AtomicUsize::new(0));
        ActionRegistry::new().add([counting("inert", &count)]).await;
    }

    #[tokio::test]
    async fn panicking_action_does_not_stop_others() {
        let registry = ActionRegistry::with_reap_interval(Duration::from_millis(20));
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .add([
                Action::new("boom", |_ctx, _input| async { explode() }).with_channel(),
                counting("steady", &count).with_channel(),
            ])
            .await;
        registry.start();

        assert!(registry.exec(ActionInput::new(EventType::User), "boom").await);
        assert!(registry.exec(ActionInput::new(EventType::User), "steady").await);
        wait_for(&count, 1).await;

        // Let the reaper observe the panic, then fire both again.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.exec(ActionInput::new(EventType::User), "boom").await);
        assert!(registry.exec(ActionInput::new(EventType::User), "steady").await);
        wait_for(&count, 2).await;

        registry.stop(EventType::Stop).await;
    }

    #[tokio::test]
    async fn add_while_running_joins_live_loop() {
        let registry = ActionRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.add([counting("first", &count).with_channel()]).await;
        registry.start();

        registry.add([counting("second", &count).with_channel()]).await;
        assert!(registry.exec(ActionInput::new(EventType::Api), "second").await);
        wait_for(&count, 1).await;

        assert_eq!(
            registry.names(),
            vec![TriggerName::from_static("first"), TriggerName::from_static("second")]
        );
        registry.stop(EventType::Stop).await;
    }

    #[tokio::test]
    async fn stop_waits_for_running_actions() {
        let registry = ActionRegistry::new();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        registry
            .add([Action::new("slow", move |_ctx, _input| {
                let (s, f) = (Arc::clone(&s), Arc::clone(&f));
                async move {
                    s.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    f.store(true, Ordering::SeqCst);
                }
            })
            .with_channel()])
            .await;
        registry.start();

        assert!(registry.exec(ActionInput::new(EventType::User), "slow").await);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !started.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        registry.stop(EventType::Stop).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_cancels_shutdown_token() {
        let registry = ActionRegistry::new();
        let observed = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let (o, s) = (Arc::clone(&observed), Arc::clone(&started));
        registry
            .add([Action::new("waiter", move |ctx, _input| {
                let (o, s) = (Arc::clone(&o), Arc::clone(&s));
                async move {
                    s.store(true, Ordering::SeqCst);
                    ctx.shutdown.cancelled().await;
                    o.store(true, Ordering::SeqCst);
                }
            })
            .with_channel()])
            .await;
        registry.start();

        assert!(registry.exec(ActionInput::new(EventType::User), "waiter").await);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !started.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), registry.stop(EventType::Stop))
            .await
            .expect("stop should drain once the token is cancelled");
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn restart_recreates_channels() {
        let registry = ActionRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.add([counting("again", &count).with_channel()]).await;

        registry.start();
        assert!(registry.exec(ActionInput::new(EventType::User), "again").await);
        wait_for(&count, 1).await;
        registry.stop(EventType::Reload).await;

        registry.start();
        assert!(registry.exec(ActionInput::new(EventType::Reload), "again").await);
        wait_for(&count, 2).await;
        registry.stop(EventType::Stop).await;
    }
}
