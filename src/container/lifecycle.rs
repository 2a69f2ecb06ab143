// ABOUTME: Idempotent stop/remove/cleanup operations plus listing and liveness checks for containers
// Hygiene operations (ensure_stopped, cleanup) return nothing and only log their failures

use super::runner::ContainerHandle;
use super::spec::PortMapping;
use crate::engine::{argv, CommandExecutor, EngineError, ExecOptions, ListOptions, Result};
use crate::monitor::{MonitorOptions, ProcessMonitor};
use crate::probe::{FetchCondition, FetchProbe, ProbeTuning, ReadinessProber};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long log capture may keep flushing after a stop attempt.
pub const STOP_LOG_GRACE: Duration = Duration::from_secs(1);
const SUMMARY_FORMAT: &str = "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}\t{{.Ports}}";
const NAME_FORMAT: &str = "{{.ID}}\t{{.Names}}";

/// Flags for `rm`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// `-f`: remove even if running.
    pub force: bool,
    /// `-v`: also remove anonymous volumes.
    pub volumes: bool,
}

impl RemoveOptions {
    /// Force removal, keep volumes.
    pub fn forced() -> Self {
        Self {
            force: true,
            volumes: false,
        }
    }

    /// Toggle volume removal.
    pub fn with_volumes(mut self, volumes: bool) -> Self {
        self.volumes = volumes;
        self
    }
}

/// One row of [`ContainerLifecycle::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Image the container was created from.
    pub image: String,
    /// Human status as the engine prints it, e.g. `Up 2 minutes`.
    pub status: String,
    /// Port bindings, empty for stopped containers.
    pub ports: String,
}

impl ContainerSummary {
    fn parse(row: &str) -> Option<Self> {
        let mut fields = row.split('\t').map(str::trim);
        let id = fields.next().filter(|s| !s.is_empty())?.to_string();
        let name = fields.next().filter(|s| !s.is_empty())?.to_string();
        Some(Self {
            id,
            name,
            image: fields.next().unwrap_or_default().to_string(),
            status: fields.next().unwrap_or_default().to_string(),
            ports: fields.next().unwrap_or_default().to_string(),
        })
    }
}

/// Stop, remove, restart and inspect containers that already exist.
pub struct ContainerLifecycle {
    executor: Arc<dyn CommandExecutor>,
    prober: ReadinessProber,
    verbose: bool,
}

impl ContainerLifecycle {
    /// Lifecycle operations over `executor` with a default prober.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            prober: ReadinessProber::new(),
            verbose: false,
        }
    }

    /// Use `prober` for `is_running` checks.
    pub fn with_prober(mut self, prober: ReadinessProber) -> Self {
        self.prober = prober;
        self
    }

    /// Echo logs captured during `stop`.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Force-remove any container (running or not) named exactly `name`.
    pub async fn ensure_stopped(&self, name: &str) {
        let options = ListOptions::all()
            .with_filter(format!("name={}", name))
            .with_format(NAME_FORMAT);
        let listing = match self.executor.execute(&options.to_args(), &ExecOptions::new()).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Failed to look up existing container {}: {}", name, e);
                return;
            }
        };

        let slashed = format!("/{}", name);
        for row in listing.lines() {
            let mut fields = row.split('\t');
            let (Some(id), Some(found)) = (fields.next(), fields.next()) else {
                continue;
            };
            let found = found.trim();
            if found != name && found != slashed {
                continue;
            }
            info!("Removing existing container {} ({})", name, id);
            let args = argv(["rm", "-f", id.trim()]);
            if let Err(e) = self.executor.execute(&args, &ExecOptions::new()).await {
                warn!("Failed to remove existing container {}: {}", name, e);
            }
        }
    }

    /// Stop a container, capturing its logs so a failure can report them.
    pub async fn stop(&self, handle: &ContainerHandle, timeout: Option<Duration>) -> Result<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let capture = match self.executor.spawn(&argv(["logs", "-f", handle.id()])) {
            Ok(process) => Some(ProcessMonitor::start(
                process,
                MonitorOptions::new(handle.id())
                    .with_echo(self.verbose, "stop")
                    .with_capture(tx),
            )),
            Err(e) => {
                warn!("Could not capture logs while stopping {}: {}", handle, e);
                None
            }
        };

        let mut args = argv(["stop"]);
        if let Some(timeout) = timeout {
            args.push("-t".to_string());
            args.push(timeout.as_secs().to_string());
        }
        args.push(handle.id().to_string());

        info!("Stopping container {}", handle);
        let result = self.executor.execute(&args, &ExecOptions::new()).await;

        if let Some(monitor) = capture {
            monitor.drain(STOP_LOG_GRACE).await;
        }
        let mut logs = Vec::new();
        while let Ok(event) = rx.try_recv() {
            logs.push(event.to_string());
        }
        debug!("Captured {} log lines while stopping {}", logs.len(), handle);

        result.map_err(|e| EngineError::StopFailed {
            container_id: handle.id().to_string(),
            reason: e.to_string(),
            logs,
        })
    }

    /// Remove a container. The handle is consumed since the id is dead afterwards.
    pub async fn remove(&self, handle: ContainerHandle, options: RemoveOptions) -> Result<String> {
        let mut args = argv(["rm"]);
        if options.force {
            args.push("-f".to_string());
        }
        if options.volumes {
            args.push("-v".to_string());
        }
        args.push(handle.id().to_string());

        info!("Removing container {}", handle);
        self.executor.execute(&args, &ExecOptions::new()).await
    }

    /// Restart a stopped container.
    pub async fn start(&self, handle: &ContainerHandle) -> Result<String> {
        info!("Starting container {}", handle);
        self.executor
            .execute(&argv(["start", handle.id()]), &ExecOptions::new())
            .await
    }

    /// Stop then remove, logging failures of either step.
    pub async fn cleanup(&self, handle: ContainerHandle, force: bool) {
        if let Err(e) = self.stop(&handle, None).await {
            warn!("Cleanup: stop of {} failed: {}", handle, e);
        }
        let id = handle.id().to_string();
        let options = RemoveOptions {
            force,
            volumes: false,
        };
        if let Err(e) = self.remove(handle, options).await {
            warn!("Cleanup: removal of {} failed: {}", id, e);
        }
    }

    /// Probe the first external port for any HTTP response.
    pub async fn is_running(&self, ports: &[PortMapping], tuning: ProbeTuning) -> Result<bool> {
        let port = ports.first().ok_or_else(|| {
            EngineError::Configuration("no port configured to probe".to_string())
        })?;
        let probe = tuning.apply(FetchProbe::new(
            format!("http://localhost:{}", port.external),
            FetchCondition::AnyResponse,
        ));
        Ok(self.prober.wait_for_fetch(&probe).await)
    }

    /// Containers created from `image`, including stopped ones.
    pub async fn list(&self, image: &str) -> Result<Vec<ContainerSummary>> {
        let options = ListOptions::all()
            .with_filter(format!("ancestor={}", image))
            .with_format(SUMMARY_FORMAT);
        let listing = self
            .executor
            .execute(&options.to_args(), &ExecOptions::new())
            .await?;
        Ok(listing.lines().filter_map(ContainerSummary::parse).collect())
    }
}
