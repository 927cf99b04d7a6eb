//! trigwatch - timer/trigger bus and log file watcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use trigwatch::cli::{Cli, LogFormat};
use trigwatch::config::{Config, RuntimeConfig};
use trigwatch::engine::{Engine, FILE_STATUS_ACTION, ReloadHandle};
use trigwatch::{
    ActionInput, DEFAULT_QUEUE_CAPACITY, EventType, LogNotifier, MetricsServer,
    NotificationQueue, NotificationWorker, Notifier, WebhookNotifier, initialize_metrics,
};

/// Initialize the tracing subscriber with the specified log format.
fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    match format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true)
                .with_env_filter(filter)
                .init();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    info!(config_path = %cli.config.display(), "Loading configuration");

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %cli.config.display(), "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!("Validating configuration");
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!(error = %e, "Configuration validation error");
        }
        error!(
            error_count = errors.len(),
            "Configuration validation failed"
        );
        std::process::exit(1);
    }

    if cli.validate {
        println!("Configuration is valid: {}", cli.config.display());
        println!(
            "  Notifier: {}",
            config
                .notifier
                .as_ref()
                .map_or("none (log only)", |n| n.url.as_str())
        );
        println!("  Watched files: {}", config.file_watch.files.len());
        println!(
            "  Heartbeat: {}",
            config.timers.heartbeat.map_or_else(
                || "disabled".to_string(),
                |d| humantime_serde::re::humantime::format_duration(d).to_string()
            )
        );
        println!("  Custom timers: {}", config.timers.custom.len());
        println!(
            "  Metrics: {} (port {})",
            if config.metrics.enabled {
                "enabled"
            } else {
                "disabled"
            },
            config.metrics.port
        );
        return Ok(());
    }

    let runtime_config = config.compile()?;
    info!(config_path = %cli.config.display(), "trigwatch starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(runtime_config, cli.config, cli.shutdown_timeout))
}

/// Load, validate and compile the configuration for a reload.
fn reload_config(path: &Path) -> Result<RuntimeConfig> {
    let config = Config::load(path)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!(error = %e, "Configuration validation error");
        }
        anyhow::bail!("{} validation error(s)", errors.len());
    }
    Ok(config.compile()?)
}

/// Why the engine is being stopped.
enum Wake {
    Shutdown,
    Reload(String),
}

/// Stop the engine, bounded by `timeout`.
async fn stop_engine(engine: &Engine, event: EventType, timeout: Duration) {
    if tokio::time::timeout(timeout, engine.stop(event)).await.is_err() {
        warn!(timeout = ?timeout, event = %event, "Engine did not stop in time");
    }
}

async fn run(
    runtime_config: RuntimeConfig,
    config_path: PathBuf,
    shutdown_timeout: Duration,
) -> Result<()> {
    let notifier: Arc<dyn Notifier> = match &runtime_config.notifier {
        Some(config) => Arc::new(WebhookNotifier::from_config(config)?),
        None => {
            warn!("No notifier configured, requests will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let queue = NotificationQueue::new(DEFAULT_QUEUE_CAPACITY);
    let mut worker = NotificationWorker::new(&queue, notifier);
    let cancel = CancellationToken::new();

    let metrics_handle = if runtime_config.metrics.enabled {
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let server = MetricsServer::with_ready_signal(runtime_config.metrics.port, ready_tx);
        let cancel_metrics = cancel.clone();
        info!(port = runtime_config.metrics.port, "Starting metrics server");
        let handle = tokio::spawn(async move {
            if let Err(e) = server.run(cancel_metrics).await {
                error!(error = %e, "Metrics server error");
            }
        });
        if ready_rx.await.is_ok() {
            let paths: Vec<&str> = runtime_config.files.iter().map(|f| f.path.as_str()).collect();
            let timers: Vec<&str> = runtime_config.timers.iter().map(|t| t.name.as_str()).collect();
            initialize_metrics(&paths, &timers);
        }
        Some(handle)
    } else {
        info!("Metrics server disabled");
        None
    };

    let worker_cancel = cancel.clone();
    let worker_handle = tokio::spawn(async move {
        worker.run(worker_cancel).await;
    });

    // The notifier and the metrics server keep their startup settings across reloads.
    let (reload, mut reloads) = ReloadHandle::channel();
    let mut current = runtime_config.clone();
    let mut engine = Engine::new(runtime_config, queue).await;
    engine.set_reload_handle(reload.clone());
    engine.start();

    loop {
        match wait_for_signal(&engine, &reload, &mut reloads).await {
            Wake::Shutdown => break,
            Wake::Reload(reason) => {
                info!(reason = %reason, config_path = %config_path.display(), "Reloading configuration");
                stop_engine(&engine, EventType::Reload, shutdown_timeout).await;
                match reload_config(&config_path) {
                    Ok(config) => current = config,
                    Err(e) => error!(error = %e, "Reload failed, keeping previous configuration"),
                }
                engine = engine.rebuild(current.clone()).await;
                engine.start();
            }
        }
    }

    info!("Received shutdown signal, initiating graceful shutdown");
    stop_engine(&engine, EventType::Stop, shutdown_timeout).await;

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker_handle).await;
    if let Some(handle) = metrics_handle {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    info!("trigwatch shutdown complete");
    Ok(())
}

/// Wait for ctrl-c or a reload request.
///
/// On unix, SIGHUP requests a reload and SIGUSR1 fires the file watcher
/// status action meanwhile.
#[cfg(unix)]
async fn wait_for_signal(
    engine: &Engine,
    reload: &ReloadHandle,
    reloads: &mut mpsc::Receiver<String>,
) -> Wake {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    fn listen(kind: SignalKind, name: &str) -> Option<Signal> {
        match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, signal = name, "Failed to listen for signal");
                None
            }
        }
    }

    async fn recv(signal: &mut Option<Signal>) -> Option<()> {
        match signal.as_mut() {
            Some(s) => s.recv().await,
            None => std::future::pending().await,
        }
    }

    let mut usr1 = listen(SignalKind::user_defined1(), "SIGUSR1");
    let mut hup = listen(SignalKind::hangup(), "SIGHUP");

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for ctrl-c signal");
                }
                return Wake::Shutdown;
            }
            Some(reason) = reloads.recv() => return Wake::Reload(reason),
            Some(()) = recv(&mut hup) => {
                reload.reload("SIGHUP");
            }
            Some(()) = recv(&mut usr1) => {
                engine
                    .exec(ActionInput::new(EventType::Signal), FILE_STATUS_ACTION)
                    .await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(
    _engine: &Engine,
    _reload: &ReloadHandle,
    reloads: &mut mpsc::Receiver<String>,
) -> Wake {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for ctrl-c signal");
            }
            Wake::Shutdown
        }
        Some(reason) = reloads.recv() => Wake::Reload(reason),
    }
}
