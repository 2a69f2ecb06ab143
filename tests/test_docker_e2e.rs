// ABOUTME: End-to-end tests against a real docker daemon
// Run with: cargo test --test test_docker_e2e -- --ignored

use dockhand::container::RunSpec;
use dockhand::{CliExecutor, Container, EngineError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore] // Requires a running docker daemon and the alpine image
async fn test_e2e_run_until_ready_then_cleanup() {
    let spec = RunSpec::new("alpine:3")
        .with_name("dockhand-e2e-ready")
        .with_command("sh -c 'echo booting; sleep 1; echo READY; sleep 30'")
        .with_wait_for("READY", Duration::from_secs(20));
    let mut container = Container::new(Arc::new(CliExecutor::default()), spec);

    container.ensure_stopped().await;
    let outcome = container.run(&CancellationToken::new()).await.unwrap();
    assert!(!outcome.is_interrupted());
    assert!(container.handle().is_some());

    container.cleanup(true).await;
    assert!(container.handle().is_none());
}

#[tokio::test]
#[ignore] // Requires a running docker daemon and the alpine image
async fn test_e2e_exit_without_match() {
    let spec = RunSpec::new("alpine:3")
        .with_name("dockhand-e2e-exit")
        .with_command("echo never ready")
        .with_wait_for("READY", Duration::from_secs(20));
    let mut container = Container::new(Arc::new(CliExecutor::default()), spec);

    container.ensure_stopped().await;
    let err = container.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::StreamEndedWithoutMatch { .. }));

    container.ensure_stopped().await;
}
