// ABOUTME: Error taxonomy for engine commands, readiness waits, and container lifecycle
// Every fallible library operation returns EngineError through the crate Result alias

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Everything that can go wrong while driving the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine command exited unsuccessfully.
    #[error("Command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Exit status as reported by the OS.
        status: String,
        /// Trimmed stderr of the failed attempt.
        stderr: String,
    },
    /// The engine binary could not be started.
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// An operation needed a container id that was never obtained.
    #[error("No containerId: container has not been started")]
    NoContainerId,
    /// Neither the pattern nor the signal showed up in time.
    #[error("Timeout waiting for {target} ({timeout:?})")]
    ReadinessTimeout {
        /// What was being waited for.
        target: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// The log stream closed before the pattern matched.
    #[error("Container exited without matching pattern: {pattern}")]
    StreamEndedWithoutMatch {
        /// Pattern or signal that never matched.
        pattern: String,
    },
    /// Invalid run spec, command string or config file.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The readiness pattern is not a valid regex.
    #[error("Invalid readiness pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    /// `stop` failed; carries whatever logs were captured meanwhile.
    #[error("Failed to stop container {container_id}: {reason}\n\n{}", format_captured(.logs))]
    StopFailed {
        /// Container that failed to stop.
        container_id: String,
        /// Why the stop command failed.
        reason: String,
        /// Captured lines, prefixed with their stream.
        logs: Vec<String>,
    },
    /// Probe request failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// Local IO failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON from the engine.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_captured(logs: &[String]) -> String {
    if logs.is_empty() {
        "No logs captured".to_string()
    } else {
        format!("Captured logs:\n{}", logs.join("\n"))
    }
}

impl EngineError {
    /// True for the two terminal outcomes of a readiness wait that did not match.
    pub fn is_readiness_failure(&self) -> bool {
        matches!(
            self,
            EngineError::ReadinessTimeout { .. } | EngineError::StreamEndedWithoutMatch { .. }
        )
    }
}
