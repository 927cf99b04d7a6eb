//! Notification queue and worker implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{Notifier, Request};
use crate::error::QueueError;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Notification queue using broadcast channel with ring buffer.
///
/// The broadcast channel provides native Drop Oldest behavior:
/// when capacity is reached, old messages are automatically overwritten.
///
/// # Thread Safety
///
/// The queue is `Clone + Send + Sync` and can be shared across tasks.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    tx: broadcast::Sender<Request>,
}

impl NotificationQueue {
    /// Create a new notification queue with specified capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Enqueue a request (non-blocking).
    ///
    /// If the queue is full, the oldest requests are dropped (detected by
    /// receivers as `Lagged`).
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Request queued.
    /// * `Err(QueueError::Closed)` - No active receivers.
    pub fn send(&self, request: Request) -> Result<(), QueueError> {
        tracing::trace!(route = %request.route, "Enqueueing request");
        self.tx.send(request).map_err(|_| QueueError::Closed)?;

        let queue_size = self.tx.len();
        tracing::trace!(queue_size = queue_size, "Request enqueued");
        metrics::gauge!("trigwatch_queue_size").set(queue_size as f64);

        Ok(())
    }

    /// Log and enqueue a request, ignoring delivery outcome.
    pub fn send_data(&self, request: Request) {
        if !request.log_message.is_empty() {
            if request.log_payload {
                tracing::info!(
                    route = %request.route,
                    event = %request.event,
                    payload = %request.payload,
                    "{}",
                    request.log_message
                );
            } else {
                tracing::info!(
                    route = %request.route,
                    event = %request.event,
                    "{}",
                    request.log_message
                );
            }
        }

        if let Err(e) = self.send(request) {
            tracing::debug!(error = %e, "No notification worker, request discarded");
        }
    }

    /// Create a new receiver for this queue.
    pub fn subscribe(&self) -> broadcast::Receiver<Request> {
        self.tx.subscribe()
    }

    /// Get the current number of messages in the queue.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.tx.len() == 0
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Worker that consumes requests from the queue and delivers them.
///
/// The worker runs in a loop, processing requests until cancelled
/// or the queue is closed.
pub struct NotificationWorker {
    rx: broadcast::Receiver<Request>,
    /// Reference to sender for queue size metrics.
    tx: broadcast::Sender<Request>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationWorker {
    /// Create a worker subscribed to `queue`.
    ///
    /// Subscribe before producers start: requests sent while no worker exists
    /// are discarded.
    pub fn new(queue: &NotificationQueue, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            rx: queue.subscribe(),
            tx: queue.tx.clone(),
            notifier,
        }
    }

    /// Run the worker loop until cancelled or queue closed.
    ///
    /// The worker will:
    /// 1. Consume requests from the queue
    /// 2. Handle `Lagged` errors by logging and updating metrics
    /// 3. Deliver each request through the notifier
    /// 4. Stop gracefully when cancellation is requested
    pub async fn run(&mut self, cancel: CancellationToken) {
        tracing::debug!(notifier = %self.notifier.notifier_type(), "Notification worker started");

        loop {
            tokio::select! {
                result = self.rx.recv() => {
                    match result {
                        Ok(request) => {
                            self.process(request).await;
                            metrics::gauge!("trigwatch_queue_size").set(self.tx.len() as f64);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(
                                dropped_count = n,
                                "Queue full, dropping {} oldest requests",
                                n
                            );
                            metrics::counter!("trigwatch_notify_dropped_total").increment(n);
                            metrics::gauge!("trigwatch_queue_size").set(self.tx.len() as f64);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::debug!("Notification queue closed");
                            return;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("Notification worker shutting down gracefully");
                    return;
                }
            }
        }
    }

    async fn process(&self, request: Request) {
        let span = tracing::info_span!(
            "process_notification",
            route = %request.route,
            event = %request.event
        );

        async {
            match self.notifier.send(&request).await {
                Ok(()) => {
                    tracing::debug!(notifier = %self.notifier.notifier_type(), "Notification sent");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        notifier = %self.notifier.notifier_type(),
                        "Failed to send notification after all retries"
                    );
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for NotificationWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationWorker")
            .field("notifier", &self.notifier.notifier_type())
            .finish()
    }
}

/// Calculate exponential backoff delay.
///
/// Formula: min(base * 2^attempt, max)
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let delay = base.saturating_mul(2_u32.saturating_pow(attempt));
    std::cmp::min(delay, max)
}
