//! Integration tests for the file watcher against real files.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tokio::sync::broadcast;
use trigwatch::config::{WatchFileConfig, WatcherSettings};
use trigwatch::error::WatchError;
use trigwatch::filewatch::FileWatcher;
use trigwatch::{NotificationQueue, Request, Route};

fn settings(max_retries: u32) -> WatcherSettings {
    WatcherSettings {
        retry_interval: Duration::from_millis(100),
        max_retries,
        ..WatcherSettings::default()
    }
}

fn polled(path: &Path, regex: &str) -> WatchFileConfig {
    let mut config = WatchFileConfig::new(path.to_str().unwrap(), regex);
    config.poll = true;
    config
}

fn append(path: &Path, lines: &[&str]) {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

async fn collect(rx: &mut broadcast::Receiver<Request>, count: usize) -> Vec<Request> {
    let mut requests = Vec::new();
    while requests.len() < count {
        let request = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("request not received in time")
            .unwrap();
        requests.push(request);
    }
    requests
}

fn drain(rx: &mut broadcast::Receiver<Request>) -> Vec<Request> {
    let mut requests = Vec::new();
    while let Ok(request) = rx.try_recv() {
        requests.push(request);
    }
    requests
}

#[tokio::test]
async fn error_lines_are_forwarded_and_debug_lines_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.log");
    std::fs::write(&path, "ERROR written before start\n").unwrap();

    let queue = NotificationQueue::default();
    let mut rx = queue.subscribe();
    let watcher = FileWatcher::new(settings(6), queue);
    watcher.start([polled(&path, "ERROR").with_skip("DEBUG")]);

    append(
        &path,
        &["INFO ok", "ERROR DEBUG verbose", "", "ERROR one", "ERROR two"],
    );

    let file = watcher.files()[0].clone();
    eventually("two matches", || file.stats().matched == 2).await;
    let requests = collect(&mut rx, 2).await;
    let lines: Vec<&str> = requests
        .iter()
        .map(|r| r.payload["line"].as_str().unwrap())
        .collect();
    assert_eq!(lines, vec!["ERROR one", "ERROR two"]);
    assert!(requests.iter().all(|r| r.route == Route::LogLine));

    let stats = file.stats();
    assert_eq!(stats.lines, 5);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.dropped, 0);

    watcher.stop().await;
}

#[tokio::test]
async fn burst_beyond_limiter_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("burst.log");
    std::fs::write(&path, "").unwrap();

    let queue = NotificationQueue::default();
    let mut rx = queue.subscribe();
    let watcher = FileWatcher::new(
        WatcherSettings {
            refill: Duration::from_secs(3600),
            ..settings(6)
        },
        queue,
    );
    watcher.start([polled(&path, "ERROR")]);

    let lines: Vec<String> = (0..10).map(|i| format!("ERROR {i}")).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    append(&path, &refs);

    let file = watcher.files()[0].clone();
    eventually("all lines processed", || file.stats().matched == 10).await;

    assert_eq!(file.stats().dropped, 4);
    assert_eq!(drain(&mut rx).len(), 6);

    watcher.stop().await;
}

#[tokio::test]
async fn dead_tail_is_retried_until_bound() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("required.log");
    std::fs::write(&path, "").unwrap();

    let mut config = polled(&path, "ERROR");
    config.must_exist = true;

    let watcher = FileWatcher::new(settings(3), NotificationQueue::default());
    watcher.start([config]);
    let file = watcher.files()[0].clone();
    assert!(file.is_active());

    std::fs::remove_file(&path).unwrap();

    eventually("retries exhausted", || file.retries() == 3).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats = file.stats();
    assert_eq!(stats.retries, 3, "no attempts beyond the bound");
    assert_eq!(stats.restarts, 0);
    // One death plus three failed setups.
    assert_eq!(stats.errors, 4);
    assert!(!file.is_active());
    assert_eq!(watcher.active(), 0);

    watcher.stop().await;
}

#[tokio::test]
async fn dead_tail_restarts_when_file_returns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flaky.log");
    std::fs::write(&path, "").unwrap();

    let mut config = polled(&path, "ERROR");
    config.must_exist = true;

    let queue = NotificationQueue::default();
    let mut rx = queue.subscribe();
    let watcher = FileWatcher::new(settings(50), queue);
    watcher.start([config]);
    let file = watcher.files()[0].clone();

    std::fs::remove_file(&path).unwrap();
    eventually("tail death", || !file.is_active()).await;

    std::fs::write(&path, "").unwrap();
    eventually("restart", || file.stats().restarts == 1).await;
    assert_eq!(file.retries(), 0);
    eventually("back on the loop", || watcher.active() == 1).await;

    append(&path, &["ERROR after restart"]);
    let requests = collect(&mut rx, 1).await;
    assert_eq!(requests[0].payload["line"], "ERROR after restart");

    watcher.stop().await;
}

#[tokio::test]
async fn add_watcher_replaces_parked_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("late.log");

    let mut config = polled(&path, "ERROR");
    config.must_exist = true;

    let watcher = FileWatcher::new(settings(6), NotificationQueue::default());
    watcher.start([config.clone()]);
    assert!(!watcher.files()[0].is_active());

    // Still missing: the error is returned and the file stays listed.
    let err = watcher.add_watcher(config.clone()).await.unwrap_err();
    assert!(matches!(err, WatchError::Tail { .. }));
    assert_eq!(watcher.files().len(), 1);

    std::fs::write(&path, "").unwrap();
    let file = watcher.add_watcher(config).await.unwrap();
    assert!(file.is_active());
    assert_eq!(watcher.files().len(), 1);
    eventually("added to loop", || watcher.active() == 1).await;

    watcher.stop().await;
    assert!(!file.is_active());
}

#[tokio::test]
async fn stop_closes_every_tail() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<_> = (0..3)
        .map(|i| {
            let path = dir.path().join(format!("f{i}.log"));
            std::fs::write(&path, "").unwrap();
            path
        })
        .collect();

    let watcher = FileWatcher::new(settings(6), NotificationQueue::default());
    watcher.start(paths.iter().map(|p| polled(p, "ERROR")));
    assert_eq!(watcher.active(), 3);

    tokio::time::timeout(Duration::from_secs(5), watcher.stop())
        .await
        .expect("stop should drain");
    assert!(watcher.files().iter().all(|f| !f.is_active()));
    assert_eq!(watcher.active(), 0);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_drains_pipe_with_idle_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.pipe");
    let status = std::process::Command::new("mkfifo")
        .arg(&path)
        .status()
        .unwrap();
    assert!(status.success());

    let queue = NotificationQueue::default();
    let mut rx = queue.subscribe();
    let watcher = FileWatcher::new(settings(6), queue);
    let mut config = WatchFileConfig::new(path.to_str().unwrap(), "ERROR");
    config.pipe = true;
    watcher.start([config]);

    let writer_path = path.clone();
    let mut writer = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new().write(true).open(writer_path)
    })
    .await
    .unwrap()
    .unwrap();
    writeln!(writer, "ERROR through the pipe").unwrap();

    let requests = collect(&mut rx, 1).await;
    assert_eq!(requests[0].payload["line"], "ERROR through the pipe");

    tokio::time::timeout(Duration::from_secs(3), watcher.stop())
        .await
        .expect("stop should drain while the writer is idle");
    assert_eq!(watcher.active(), 0);
    drop(writer);
}
