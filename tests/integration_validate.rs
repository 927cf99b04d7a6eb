//! Integration tests for the --validate CLI mode.

use std::path::PathBuf;
use std::process::{Command, Output};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn run_validate(fixture: &str) -> Output {
    Command::new(env!("CARGO_BIN_EXE_trigwatch"))
        .args(["--validate", "-c"])
        .arg(fixture_path(fixture))
        .env_remove("LOG_FORMAT")
        .output()
        .expect("Failed to run trigwatch")
}

#[test]
fn validate_valid_config_exits_success() {
    let output = run_validate("config_valid.yaml");

    assert!(
        output.status.success(),
        "trigwatch --validate should exit with code 0 for valid config\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration is valid"), "{}", stdout);
    assert!(
        stdout.contains("Notifier: https://notify.example.com/api"),
        "{}",
        stdout
    );
    assert!(stdout.contains("Watched files: 3"), "{}", stdout);
    assert!(stdout.contains("Heartbeat: 5m"), "{}", stdout);
    assert!(stdout.contains("Custom timers: 2"), "{}", stdout);
    assert!(stdout.contains("port 9191"), "{}", stdout);
}

#[test]
fn validate_does_not_require_secret_env_vars() {
    // ${TRIGWATCH_API_KEY} is only resolved when the notifier is built.
    let output = Command::new(env!("CARGO_BIN_EXE_trigwatch"))
        .args(["--validate", "-c"])
        .arg(fixture_path("config_valid.yaml"))
        .env_remove("TRIGWATCH_API_KEY")
        .output()
        .expect("Failed to run trigwatch");

    assert!(output.status.success());
}

#[test]
fn validate_minimal_config_reports_log_only_notifier() {
    let output = run_validate("config_minimal.yaml");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Notifier: none (log only)"), "{}", stdout);
    assert!(stdout.contains("Heartbeat: disabled"), "{}", stdout);
}

#[test]
fn validate_invalid_regex_exits_failure() {
    let output = run_validate("config_invalid_regex.yaml");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("/var/log/app.log"),
        "Error should name the offending file: {}",
        stderr
    );
}

#[test]
fn validate_reports_every_error() {
    let output = run_validate("config_multiple_errors.yaml");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Configuration validation failed"), "{}", stderr);
    assert!(stderr.contains("duplicate name 'twice'"), "{}", stderr);
    assert!(stderr.contains("name 'heartbeat' is reserved"), "{}", stderr);
}

#[test]
fn validate_invalid_yaml_exits_failure() {
    let output = run_validate("config_invalid_yaml.yaml");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration"), "{}", stderr);
}

#[test]
fn validate_missing_file_exits_failure() {
    let output = run_validate("does_not_exist.yaml");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does_not_exist.yaml"), "{}", stderr);
}
