//! Prometheus metrics exposition server.
//!
//! Exposes trigwatch metrics in Prometheus format on a configurable port.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Set once the global recorder is installed.
static RECORDER_INSTALLED: OnceLock<()> = OnceLock::new();

/// Register all metric descriptions (HELP text) for Prometheus.
pub fn register_metric_descriptions() {
    use metrics::{describe_counter, describe_gauge};

    // File watcher
    describe_counter!(
        "trigwatch_file_lines_total",
        "Lines read from a watched file"
    );
    describe_counter!(
        "trigwatch_file_matched_total",
        "Lines that matched the file's pattern and not its skip pattern"
    );
    describe_counter!(
        "trigwatch_file_skipped_total",
        "Matching lines excluded by the skip pattern"
    );
    describe_counter!(
        "trigwatch_file_dropped_total",
        "Matched lines dropped by the rate limiter"
    );
    describe_counter!(
        "trigwatch_file_errors_total",
        "Setup failures and unexpected tail deaths"
    );
    describe_counter!(
        "trigwatch_file_retries_total",
        "Restart attempts made by the maintenance tick"
    );
    describe_counter!(
        "trigwatch_file_restarts_total",
        "Successful restarts of a dead file watch"
    );

    // Actions
    describe_counter!(
        "trigwatch_action_runs_total",
        "Action invocations started"
    );
    describe_counter!(
        "trigwatch_action_panics_total",
        "Action invocations that panicked"
    );
    describe_counter!(
        "trigwatch_mux_panics_total",
        "Dispatch loop handler callbacks that panicked"
    );

    // Notifications
    describe_counter!(
        "trigwatch_notify_sent_total",
        "Requests delivered to the notifier"
    );
    describe_counter!(
        "trigwatch_notify_errors_total",
        "Failed delivery attempts, including retried ones"
    );
    describe_counter!(
        "trigwatch_notify_failed_total",
        "Requests that permanently failed after all retries"
    );
    describe_counter!(
        "trigwatch_notify_dropped_total",
        "Requests dropped because the queue overflowed"
    );

    // Gauges
    describe_gauge!(
        "trigwatch_mux_active_sources",
        "Data sources currently on a dispatch loop"
    );
    describe_gauge!(
        "trigwatch_queue_size",
        "Current number of requests in the notification queue"
    );
    describe_gauge!(
        "trigwatch_uptime_seconds",
        "Time in seconds since trigwatch started"
    );
    describe_gauge!(
        "trigwatch_build_info",
        "Build information with version label (always 1)"
    );
}

/// Metrics server for Prometheus exposition on `/metrics`.
pub struct MetricsServer {
    port: u16,
    /// Signalled once the recorder is installed, so callers can wait before
    /// emitting metrics that would otherwise be lost.
    ready_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsServer {
    /// Create a server bound to `port` (0 lets the OS pick one).
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ready_tx: None,
        }
    }

    pub fn with_ready_signal(port: u16, ready_tx: tokio::sync::oneshot::Sender<()>) -> Self {
        Self {
            port,
            ready_tx: Some(ready_tx),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Install the global recorder and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be installed (port in use, or
    /// a recorder already installed in this process).
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();

        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

        let _ = RECORDER_INSTALLED.set(());
        register_metric_descriptions();

        if let Some(tx) = self.ready_tx {
            let _ = tx.send(());
        }

        info!(port = self.port, "Metrics server started on /metrics");
        cancel.cancelled().await;
        info!("Metrics server shutting down");

        Ok(())
    }
}

/// Whether the metrics recorder has been installed.
pub fn is_recorder_installed() -> bool {
    RECORDER_INSTALLED.get().is_some()
}

/// Initialize known series so they appear in `/metrics` from startup.
///
/// `paths` are the configured watch files, `actions` the registered action names.
pub fn initialize_metrics(paths: &[&str], actions: &[&str]) {
    use metrics::{counter, gauge};

    gauge!("trigwatch_build_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
    gauge!("trigwatch_uptime_seconds").set(0.0);
    gauge!("trigwatch_queue_size").set(0.0);
    counter!("trigwatch_notify_dropped_total").absolute(0);

    for path in paths {
        for name in [
            "trigwatch_file_lines_total",
            "trigwatch_file_matched_total",
            "trigwatch_file_skipped_total",
            "trigwatch_file_dropped_total",
            "trigwatch_file_errors_total",
            "trigwatch_file_retries_total",
            "trigwatch_file_restarts_total",
        ] {
            counter!(name, "path" => path.to_string()).absolute(0);
        }
    }

    for action in actions {
        counter!("trigwatch_action_runs_total", "action" => action.to_string()).absolute(0);
        counter!("trigwatch_action_panics_total", "action" => action.to_string()).absolute(0);
    }

    tracing::info!(
        file_count = paths.len(),
        action_count = actions.len(),
        "Metrics initialized to zero"
    );
}
