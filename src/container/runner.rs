// ABOUTME: Container run orchestrator that launches a container and waits for its readiness signal
// Races log-pattern match, stream end, timeout, and interrupt; log processes never outlive the call

use super::signals::SignalScope;
use super::spec::RunSpec;
use crate::engine::{argv, CommandExecutor, EngineError, ExecOptions, Result};
use crate::monitor::{LogEvent, LogFollower, MonitorOptions, ProcessMonitor};
use regex::Regex;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Matches within this window after an end-of-instance marker are debounced.
const SIGNAL_DEBOUNCE: Duration = Duration::from_millis(100);
const RUN_LOG_TAIL: &str = "100000";

/// Opaque identifier of a live container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    /// Fails with `NoContainerId` when the id is blank.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(EngineError::NoContainerId);
        }
        Ok(Self(id))
    }

    /// The engine's container id.
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal state of a single readiness wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// First matching line across both streams.
    Matched(LogEvent),
    /// The deadline passed first.
    TimedOut,
    /// Both streams closed without a match.
    StreamEndedWithoutMatch,
    /// The token was cancelled first.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Launching,
    AwaitingId,
    AwaitingPattern,
    Ready,
    Failed,
    Cancelled,
}

/// Result of [`ContainerRunner::run`] when nothing failed.
#[derive(Debug)]
pub enum RunOutcome {
    /// The container started (and matched its readiness pattern, if any).
    /// `follower` keeps echoing output when continued output was requested.
    Ready {
        /// The running container.
        handle: ContainerHandle,
        /// Present only with `show_output`.
        follower: Option<LogFollower>,
    },
    /// An interrupt arrived before readiness. Carries whatever id was obtained.
    Interrupted {
        /// `None` when the launch itself was interrupted.
        handle: Option<ContainerHandle>,
    },
}

impl RunOutcome {
    /// The container id, if one was obtained.
    pub fn handle(&self) -> Option<&ContainerHandle> {
        match self {
            RunOutcome::Ready { handle, .. } => Some(handle),
            RunOutcome::Interrupted { handle } => handle.as_ref(),
        }
    }

    /// Whether an interrupt cut the run short.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunOutcome::Interrupted { .. })
    }
}

/// Launches containers and waits for them to become ready.
pub struct ContainerRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl ContainerRunner {
    /// Runner issuing commands through `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn transition(&self, from: RunState, to: RunState) {
        debug!("run state {:?} -> {:?}", from, to);
    }

    /// Launch the container described by `spec`.
    ///
    /// SIGINT/SIGTERM are observed only for the duration of this call. On an
    /// interrupt before readiness the launch and log processes are killed and
    /// the outcome is `Interrupted` rather than an error.
    pub async fn run(&self, spec: &RunSpec, cancel: &CancellationToken) -> Result<RunOutcome> {
        let scope = SignalScope::install(cancel)?;
        let token = scope.token();

        match spec.readiness_pattern()? {
            None => self.run_plain(spec, &token).await,
            Some(pattern) => self.run_until_ready(spec, pattern, &token).await,
        }
    }

    async fn run_plain(&self, spec: &RunSpec, token: &CancellationToken) -> Result<RunOutcome> {
        let args = spec.to_args()?;
        let exec_options = ExecOptions::new();
        info!("Running container from image {}", spec.image);

        let output = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.transition(RunState::Launching, RunState::Cancelled);
                return Ok(RunOutcome::Interrupted { handle: None });
            }
            output = self.executor.execute(&args, &exec_options) => output?,
        };

        let handle = ContainerHandle::new(output)?;
        self.transition(RunState::Launching, RunState::Ready);
        info!("Started container {}", handle);
        Ok(RunOutcome::Ready {
            handle,
            follower: None,
        })
    }

    async fn run_until_ready(
        &self,
        spec: &RunSpec,
        pattern: Regex,
        token: &CancellationToken,
    ) -> Result<RunOutcome> {
        let args = spec.to_detached_args()?;
        info!(
            "Running container from image {} and waiting for /{}/",
            spec.image, pattern
        );

        let mut launch = self.executor.spawn(&args)?;
        self.transition(RunState::Launching, RunState::AwaitingId);

        let launched = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            output = launch.output() => Some(output),
        };
        let id = match launched {
            Some(output) => output?,
            None => {
                launch.kill().await;
                self.transition(RunState::AwaitingId, RunState::Cancelled);
                return Ok(RunOutcome::Interrupted { handle: None });
            }
        };
        drop(launch);

        let handle = ContainerHandle::new(id)?;
        if token.is_cancelled() {
            self.transition(RunState::AwaitingId, RunState::Cancelled);
            return Ok(RunOutcome::Interrupted {
                handle: Some(handle),
            });
        }

        let logs = self
            .executor
            .spawn(&argv(["logs", "--tail", RUN_LOG_TAIL, "-f", handle.id()]))?;
        let keep_following = spec.show_output || spec.verbose;
        let options = MonitorOptions::new(handle.id())
            .with_pattern(pattern.clone())
            .with_echo(keep_following, "container")
            .continue_after_match(keep_following);
        let mut monitor = ProcessMonitor::start(logs, options);
        self.transition(RunState::AwaitingId, RunState::AwaitingPattern);

        let outcome = match race_readiness(&mut monitor, spec.wait_timeout, token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                monitor.shutdown().await;
                self.transition(RunState::AwaitingPattern, RunState::Failed);
                return Err(EngineError::Io(e));
            }
        };

        match outcome {
            ReadinessOutcome::Matched(event) => {
                self.transition(RunState::AwaitingPattern, RunState::Ready);
                info!(
                    "Container {} is ready (matched on {}: {})",
                    handle, event.stream, event.line
                );
                let follower = if keep_following {
                    Some(monitor.into_background())
                } else {
                    monitor.shutdown().await;
                    None
                };
                Ok(RunOutcome::Ready { handle, follower })
            }
            ReadinessOutcome::Cancelled => {
                monitor.shutdown().await;
                self.transition(RunState::AwaitingPattern, RunState::Cancelled);
                Ok(RunOutcome::Interrupted {
                    handle: Some(handle),
                })
            }
            ReadinessOutcome::TimedOut => {
                monitor.shutdown().await;
                self.transition(RunState::AwaitingPattern, RunState::Failed);
                Err(EngineError::ReadinessTimeout {
                    target: format!("pattern: {}", pattern),
                    timeout: spec.wait_timeout,
                })
            }
            ReadinessOutcome::StreamEndedWithoutMatch => {
                monitor.shutdown().await;
                self.transition(RunState::AwaitingPattern, RunState::Failed);
                Err(EngineError::StreamEndedWithoutMatch {
                    pattern: pattern.to_string(),
                })
            }
        }
    }

    /// Follow a container's full log until `signal` appears (plain substring).
    ///
    /// With `last_instance_end_signal`, a signal seen before any end marker
    /// resolves at once; one seen after an end marker must survive a short
    /// debounce without another end marker arriving.
    pub async fn wait_for_signal_in_logs(
        &self,
        handle: &ContainerHandle,
        signal: &str,
        timeout: Duration,
        last_instance_end_signal: Option<&str>,
        echo: bool,
    ) -> Result<()> {
        let logs = self
            .executor
            .spawn(&argv(["logs", "--tail", "all", "-f", handle.id()]))?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = MonitorOptions::new(handle.id())
            .with_echo(echo, "wait")
            .with_capture(tx);
        let monitor = ProcessMonitor::start(logs, options);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut last_instance_ended = last_instance_end_signal.is_none();
        let mut pending: Option<Instant> = None;

        let result = loop {
            let debounce = pending.unwrap_or_else(|| Instant::now() + SIGNAL_DEBOUNCE);
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(debounce), if pending.is_some() => break Ok(()),
                event = rx.recv() => {
                    // A pending debounce does not survive the stream closing
                    let Some(event) = event else {
                        break Err(EngineError::StreamEndedWithoutMatch {
                            pattern: signal.to_string(),
                        });
                    };
                    if let Some(end) = last_instance_end_signal {
                        if event.line.contains(end) {
                            pending = None;
                            last_instance_ended = true;
                            continue;
                        }
                    }
                    if event.line.contains(signal) {
                        if last_instance_end_signal.is_some() && last_instance_ended {
                            pending = Some(Instant::now() + SIGNAL_DEBOUNCE);
                        } else {
                            break Ok(());
                        }
                    }
                }
                _ = &mut deadline => {
                    break Err(EngineError::ReadinessTimeout {
                        target: format!("signal \"{}\" in container {} logs", signal, handle),
                        timeout,
                    });
                }
            }
        };

        monitor.shutdown().await;
        if result.is_ok() {
            info!("Found signal \"{}\" in logs of container {}", signal, handle);
        }
        result
    }
}

/// Race pattern match, stream end, timeout, and cancellation. First to resolve wins;
/// a match beats everything else when several are ready at once.
pub async fn race_readiness(
    monitor: &mut ProcessMonitor,
    timeout: Duration,
    token: &CancellationToken,
) -> io::Result<ReadinessOutcome> {
    let latch = monitor.latch();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let outcome = tokio::select! {
        biased;
        event = latch.resolved() => ReadinessOutcome::Matched(event),
        _ = token.cancelled() => ReadinessOutcome::Cancelled,
        ended = monitor.streams_ended() => {
            ended?;
            match latch.matched() {
                Some(event) => ReadinessOutcome::Matched(event),
                None => ReadinessOutcome::StreamEndedWithoutMatch,
            }
        }
        _ = &mut deadline => ReadinessOutcome::TimedOut,
    };
    Ok(outcome)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::CliExecutor;

    fn sh_monitor(script: &str, pattern: &str) -> ProcessMonitor {
        let process = CliExecutor::new("sh").spawn(&argv(["-c", script])).unwrap();
        ProcessMonitor::start(
            process,
            MonitorOptions::new("c1").with_pattern(Regex::new(pattern).unwrap()),
        )
    }

    #[test]
    fn blank_handle_is_rejected() {
        assert!(matches!(
            ContainerHandle::new("  \n"),
            Err(EngineError::NoContainerId)
        ));
        assert_eq!(ContainerHandle::new("abc\n").unwrap().id(), "abc");
    }

    #[tokio::test]
    async fn race_prefers_match() {
        let mut monitor = sh_monitor("echo booting; echo READY; exit 0", "READY");
        let outcome = race_readiness(&mut monitor, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            ReadinessOutcome::Matched(event) => assert_eq!(event.line, "READY"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn race_reports_stream_end() {
        let mut monitor = sh_monitor("echo booting >&2", "READY");
        let outcome = race_readiness(&mut monitor, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ReadinessOutcome::StreamEndedWithoutMatch);
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn race_times_out() {
        let mut monitor = sh_monitor("exec sleep 30", "READY");
        let started = std::time::Instant::now();
        let outcome = race_readiness(
            &mut monitor,
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ReadinessOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn race_observes_cancellation() {
        let mut monitor = sh_monitor("exec sleep 30", "READY");
        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                token.cancel();
            })
        };
        let outcome = race_readiness(&mut monitor, Duration::from_secs(10), &token)
            .await
            .unwrap();
        assert_eq!(outcome, ReadinessOutcome::Cancelled);
        monitor.shutdown().await;
        canceller.await.unwrap();
    }
}
