// ABOUTME: Integration tests for waiting on a plain-text signal in a container's full log history

#![cfg(unix)]

mod common;

use common::FakeEngine;
use dockhand::container::{ContainerHandle, ContainerRunner};
use dockhand::EngineError;
use std::time::{Duration, Instant};

const END: &str = "INSTANCE_END";

async fn wait(engine: &FakeEngine, timeout_ms: u64, end_signal: Option<&str>) -> dockhand::Result<()> {
    let handle = ContainerHandle::new("abc123").unwrap();
    ContainerRunner::new(engine.executor())
        .wait_for_signal_in_logs(
            &handle,
            "SERVER_READY",
            Duration::from_millis(timeout_ms),
            end_signal,
            false,
        )
        .await
}

#[tokio::test]
async fn signal_matches_as_substring() {
    let engine = FakeEngine::builder()
        .on("logs", "echo 'boot'\necho '[app] SERVER_READY on :8080'\nexec sleep 30")
        .build();

    wait(&engine, 5000, None).await.unwrap();

    assert_eq!(
        engine.calls_starting_with("logs"),
        vec!["logs --tail all -f abc123"]
    );
    assert!(!engine.logs_process_alive());
}

#[tokio::test]
async fn signal_is_not_a_regex() {
    let engine = FakeEngine::builder()
        .on("logs", "echo 'SERVER.READY'\nexec sleep 30")
        .build();
    let handle = ContainerHandle::new("abc123").unwrap();

    let err = ContainerRunner::new(engine.executor())
        .wait_for_signal_in_logs(&handle, "SERVER_READY", Duration::from_millis(400), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ReadinessTimeout { .. }));
}

#[tokio::test]
async fn signal_before_any_end_marker_resolves_immediately() {
    let engine = FakeEngine::builder()
        .on("logs", "echo SERVER_READY\nexec sleep 30")
        .build();

    wait(&engine, 5000, Some(END)).await.unwrap();
}

#[tokio::test]
async fn signal_after_end_marker_waits_out_debounce() {
    let engine = FakeEngine::builder()
        .on("logs", format!("echo {END}\necho SERVER_READY\nexec sleep 30").as_str())
        .build();

    let started = Instant::now();
    wait(&engine, 5000, Some(END)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn later_end_marker_cancels_pending_signal() {
    // The signal belongs to an instance that ended right after; nothing follows
    let engine = FakeEngine::builder()
        .on(
            "logs",
            format!("echo {END}\necho SERVER_READY\necho {END}\nexec sleep 30").as_str(),
        )
        .build();

    let err = wait(&engine, 600, Some(END)).await.unwrap_err();
    assert!(matches!(err, EngineError::ReadinessTimeout { .. }), "{err:?}");
    assert!(!engine.logs_process_alive());
}

#[tokio::test]
async fn newest_instance_signal_wins() {
    let engine = FakeEngine::builder()
        .on(
            "logs",
            format!(
                "echo {END}\necho SERVER_READY\necho {END}\nsleep 0.3\necho SERVER_READY\nexec sleep 30"
            )
            .as_str(),
        )
        .build();

    let started = Instant::now();
    wait(&engine, 5000, Some(END)).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn stream_end_without_signal_fails() {
    let engine = FakeEngine::builder().on("logs", "echo nothing here").build();

    let err = wait(&engine, 5000, None).await.unwrap_err();
    match err {
        EngineError::StreamEndedWithoutMatch { pattern } => assert_eq!(pattern, "SERVER_READY"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn stream_end_during_debounce_fails() {
    let engine = FakeEngine::builder()
        .on("logs", format!("echo {END}\necho SERVER_READY").as_str())
        .build();

    let err = wait(&engine, 5000, Some(END)).await.unwrap_err();
    assert!(
        matches!(err, EngineError::StreamEndedWithoutMatch { .. }),
        "{err:?}"
    );
}
