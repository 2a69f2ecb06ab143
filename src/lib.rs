// ABOUTME: Library crate for dockhand exposing the container run/readiness API for the CLI and tests

//! Run containers through an engine CLI, wait until they are ready, and tear
//! them down again.

/// Configuration file and environment overrides.
pub mod config;
/// Run specs, the run orchestrator, lifecycle operations and the facade.
pub mod container;
/// The engine CLI boundary.
pub mod engine;
/// Log stream line splitting and pattern watching.
pub mod monitor;
/// HTTP readiness polling.
pub mod probe;

pub use config::AppConfig;
pub use container::{Container, ContainerHandle, ContainerLifecycle, ContainerRunner, RunOutcome, RunSpec};
pub use engine::{CliExecutor, CommandExecutor, EngineError, Result};
pub use probe::{FetchCondition, FetchProbe, ProbeTuning, ReadinessProber};
