//! Integration tests for request delivery through the notification worker.
//!
//! Uses wiremock to simulate the remote notifier endpoint.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use trigwatch::config::{NotifierConfig, SecretString, WatchFileConfig, WatcherSettings};
use trigwatch::filewatch::FileWatcher;
use trigwatch::{
    EventType, NotificationQueue, NotificationWorker, Notifier, Request, Route, WebhookNotifier,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn notifier(server: &MockServer) -> Arc<dyn Notifier> {
    let config = NotifierConfig {
        url: format!("{}/api", server.uri()),
        api_key: Some(SecretString::new("test-key".to_string())),
        timeout: Duration::from_secs(5),
    };
    Arc::new(WebhookNotifier::from_config(&config).expect("valid notifier config"))
}

fn spawn_worker(
    queue: &NotificationQueue,
    notifier: Arc<dyn Notifier>,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let mut worker = NotificationWorker::new(queue, notifier);
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        worker.run(worker_cancel).await;
    });
    (cancel, handle)
}

async fn wait_for_requests(server: &MockServer, expected: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let received = server.received_requests().await.unwrap_or_default();
            if received.len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("requests not received in time");
}

#[tokio::test]
async fn worker_delivers_queued_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/timer"))
        .and(header("x-api-key", "test-key"))
        .and(body_partial_json(json!({
            "route": "timer",
            "event": "schedule",
            "payload": {"name": "svc-check"}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let queue = NotificationQueue::new(10);
    let (cancel, handle) = spawn_worker(&queue, notifier(&server));

    let request = Request::new(
        Route::Timer,
        EventType::Schedule,
        &json!({"name": "svc-check"}),
    )
    .unwrap();
    queue.send(request).unwrap();

    wait_for_requests(&server, 1).await;
    cancel.cancel();
    handle.await.unwrap();
    server.verify().await;
}

#[tokio::test]
async fn worker_retries_server_error_then_succeeds() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let server = MockServer::start().await;
    let count = Arc::new(AtomicU32::new(0));
    let responder_count = Arc::clone(&count);
    Mock::given(method("POST"))
        .and(path("/api/heartbeat"))
        .respond_with(move |_req: &wiremock::Request| {
            if responder_count.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200)
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let queue = NotificationQueue::new(10);
    let (cancel, handle) = spawn_worker(&queue, notifier(&server));
    queue
        .send(Request::new(Route::Heartbeat, EventType::Schedule, &json!({"uptime_secs": 1})).unwrap())
        .unwrap();

    wait_for_requests(&server, 2).await;
    cancel.cancel();
    handle.await.unwrap();
    server.verify().await;
}

#[tokio::test]
async fn worker_survives_client_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/logwatch"))
        .respond_with(ResponseTemplate::new(400))
        .expect(2)
        .mount(&server)
        .await;

    let queue = NotificationQueue::new(10);
    let (cancel, handle) = spawn_worker(&queue, notifier(&server));
    for line in ["first", "second"] {
        queue
            .send(Request::new(Route::LogLine, EventType::File, &json!({"line": line})).unwrap())
            .unwrap();
    }

    // Each request is attempted once; the worker keeps going after a 4xx.
    wait_for_requests(&server, 2).await;
    cancel.cancel();
    handle.await.unwrap();
    server.verify().await;
}

#[tokio::test]
async fn matched_line_reaches_notifier() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/logwatch"))
        .and(body_partial_json(json!({
            "route": "logwatch",
            "event": "file",
            "payload": {"line": "ERROR disk full", "matches": ["ERROR"]}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("app.log");
    std::fs::write(&log_path, "ERROR before start\n").unwrap();

    let queue = NotificationQueue::new(10);
    let (cancel, handle) = spawn_worker(&queue, notifier(&server));

    let watcher = FileWatcher::new(WatcherSettings::default(), queue.clone());
    let mut config = WatchFileConfig::new(log_path.to_str().unwrap(), "ERROR").with_skip("DEBUG");
    config.poll = true;
    watcher.start([config]);

    let mut log = std::fs::OpenOptions::new()
        .append(true)
        .open(&log_path)
        .unwrap();
    writeln!(log, "INFO all good").unwrap();
    writeln!(log, "ERROR DEBUG ignored").unwrap();
    writeln!(log, "  ERROR disk full  ").unwrap();

    wait_for_requests(&server, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    watcher.stop().await;
    cancel.cancel();
    handle.await.unwrap();
    server.verify().await;
}
