// ABOUTME: Container module - run specs, the run orchestrator, and lifecycle management
// Container is the stateful facade that remembers the handle of the last successful run

/// Tokenizing the container command.
pub mod command;
/// Operations on containers that already exist.
pub mod lifecycle;
/// Launch and readiness orchestration.
pub mod runner;
/// Scoped interrupt handling.
pub mod signals;
/// Run specs and their argument rendering.
pub mod spec;

pub use command::tokenize;
pub use lifecycle::{ContainerLifecycle, ContainerSummary, RemoveOptions, STOP_LOG_GRACE};
pub use runner::{race_readiness, ContainerHandle, ContainerRunner, ReadinessOutcome, RunOutcome};
pub use signals::SignalScope;
pub use spec::{PortMapping, RunOverrides, RunSpec, DEFAULT_WAIT_TIMEOUT};

use crate::engine::{CommandExecutor, EngineError, Result};
use crate::probe::{ProbeTuning, ReadinessProber};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct ActiveContainer {
    handle: ContainerHandle,
    ports: Vec<PortMapping>,
}

/// One container context: a base [`RunSpec`] plus the handle of whatever it
/// last started.
pub struct Container {
    spec: RunSpec,
    runner: ContainerRunner,
    lifecycle: ContainerLifecycle,
    active: Option<ActiveContainer>,
}

impl Container {
    /// A context for `spec` with nothing started yet.
    pub fn new(executor: Arc<dyn CommandExecutor>, spec: RunSpec) -> Self {
        let lifecycle = ContainerLifecycle::new(executor.clone()).with_verbose(spec.verbose);
        Self {
            spec,
            runner: ContainerRunner::new(executor),
            lifecycle,
            active: None,
        }
    }

    /// Use `prober` for `is_running`.
    pub fn with_prober(mut self, prober: ReadinessProber) -> Self {
        self.lifecycle = self.lifecycle.with_prober(prober);
        self
    }

    /// The base spec.
    pub fn spec(&self) -> &RunSpec {
        &self.spec
    }

    /// Lifecycle operations bound to this context's executor.
    pub fn lifecycle(&self) -> &ContainerLifecycle {
        &self.lifecycle
    }

    /// Copy the base spec with overrides; the base is left unchanged.
    pub fn derive(&self, overrides: RunOverrides) -> RunSpec {
        self.spec.derive(overrides)
    }

    /// Handle of the last successful run, until it is removed.
    pub fn handle(&self) -> Option<&ContainerHandle> {
        self.active.as_ref().map(|active| &active.handle)
    }

    fn require_handle(&self) -> Result<&ContainerHandle> {
        self.handle().ok_or(EngineError::NoContainerId)
    }

    /// Run the base spec.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let spec = self.spec.clone();
        self.run_spec(&spec, cancel).await
    }

    /// Run `spec` and, on success, remember its handle as the active container.
    pub async fn run_spec(&mut self, spec: &RunSpec, cancel: &CancellationToken) -> Result<RunOutcome> {
        let outcome = self.runner.run(spec, cancel).await?;
        if let RunOutcome::Ready { handle, .. } = &outcome {
            self.active = Some(ActiveContainer {
                handle: handle.clone(),
                ports: spec.ports.clone(),
            });
        }
        Ok(outcome)
    }

    /// Remove any container already using the base spec's name.
    pub async fn ensure_stopped(&self) {
        if let Some(name) = &self.spec.name {
            self.lifecycle.ensure_stopped(name).await;
        }
    }

    /// Restart the active container.
    pub async fn start(&self) -> Result<String> {
        self.lifecycle.start(self.require_handle()?).await
    }

    /// Stop the active container. See [`ContainerLifecycle::stop`].
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<String> {
        self.lifecycle.stop(self.require_handle()?, timeout).await
    }

    /// Remove the active container. The handle is forgotten only on success.
    pub async fn remove(&mut self, options: RemoveOptions) -> Result<String> {
        let handle = self.require_handle()?.clone();
        let output = self.lifecycle.remove(handle, options).await?;
        self.active = None;
        Ok(output)
    }

    /// Stop and remove the active container, if any. Never fails.
    pub async fn cleanup(&mut self, force: bool) {
        if let Some(active) = self.active.take() {
            self.lifecycle.cleanup(active.handle, force).await;
        }
    }

    /// `false` without probing when nothing has been run.
    pub async fn is_running(&self, tuning: ProbeTuning) -> Result<bool> {
        match &self.active {
            Some(active) => self.lifecycle.is_running(&active.ports, tuning).await,
            None => Ok(false),
        }
    }

    /// Containers created from the base spec's image.
    pub async fn list(&self) -> Result<Vec<ContainerSummary>> {
        self.lifecycle.list(&self.spec.image).await
    }

    /// Wait for `signal` in the active container's logs.
    /// See [`ContainerRunner::wait_for_signal_in_logs`].
    pub async fn wait_for_signal_in_logs(
        &self,
        signal: &str,
        timeout: Duration,
        last_instance_end_signal: Option<&str>,
    ) -> Result<()> {
        let handle = self.require_handle()?;
        self.runner
            .wait_for_signal_in_logs(
                handle,
                signal,
                timeout,
                last_instance_end_signal,
                self.spec.verbose,
            )
            .await
    }
}
