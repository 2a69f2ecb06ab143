// ABOUTME: Application configuration loaded from ~/.dockhand/config.toml with environment overrides
// Missing file or missing keys fall back to defaults; DOCKHAND_* variables win over the file

use crate::container::RunSpec;
use crate::engine::{CliExecutor, EngineError, Result};
use crate::probe::ProbeTuning;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Overrides `engine.binary`.
pub const ENGINE_ENV: &str = "DOCKHAND_ENGINE";
/// Overrides `engine.verbose`; `1`, `true`, `yes` and `on` enable it.
pub const VERBOSE_ENV: &str = "DOCKHAND_VERBOSE";

/// `[engine]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Engine CLI binary, resolved through PATH
    pub binary: String,
    /// Log every engine invocation at info level
    pub verbose: bool,
    /// Pause between retried engine commands.
    pub retry_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            verbose: false,
            retry_delay_ms: 5000,
        }
    }
}

/// `[run]` table: defaults for new run specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Readiness wait when a pattern is set.
    pub wait_timeout_ms: u64,
    /// Inject `FORCE_COLOR=1` into the container environment.
    pub force_color: bool,
    /// Echo container output while waiting.
    pub show_output: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 30000,
            force_color: true,
            show_output: false,
        }
    }
}

/// `[probe]` table: HTTP readiness polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Pause between probe attempts.
    pub retry_delay_ms: u64,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
    /// Give up after this long.
    pub timeout_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1000,
            request_timeout_ms: 2000,
            timeout_ms: 30000,
        }
    }
}

/// Everything read from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Engine binary and invocation settings.
    pub engine: EngineSettings,
    /// Run spec defaults.
    pub run: RunSettings,
    /// Probe timing.
    pub probe: ProbeSettings,
}

impl AppConfig {
    /// `~/.dockhand`, where config and logs live.
    pub fn home_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".dockhand"))
    }

    /// `~/.dockhand/config.toml`.
    pub fn config_path() -> Option<PathBuf> {
        Self::home_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load from the default location, then apply environment overrides.
    pub async fn load() -> Result<Self> {
        Self::load_with(None, |key| std::env::var(key).ok()).await
    }

    /// Load from `path`, or the default location when `None`, then apply
    /// the overrides `lookup` yields.
    pub async fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path.map(Path::to_path_buf).or_else(Self::config_path) {
            Some(path) => Self::load_from(&path).await?,
            None => Self::default(),
        };
        config.apply_overrides(lookup);
        Ok(config)
    }

    /// Parse a config file. A missing file yields defaults.
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).await.map_err(|e| {
            EngineError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            EngineError::Configuration(format!("Invalid config format in {}: {}", path.display(), e))
        })
    }

    /// Apply `DOCKHAND_*` values found through `lookup`. Blank engine names are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(binary) = lookup(ENGINE_ENV).filter(|b| !b.trim().is_empty()) {
            self.engine.binary = binary;
        }
        if let Some(verbose) = lookup(VERBOSE_ENV) {
            self.engine.verbose = matches!(
                verbose.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    /// Executor for the configured engine binary.
    pub fn executor(&self) -> CliExecutor {
        CliExecutor::new(self.engine.binary.clone()).with_verbose(self.engine.verbose)
    }

    /// Pause between retried engine commands.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.engine.retry_delay_ms)
    }

    /// Probe timing as durations.
    pub fn probe_tuning(&self) -> ProbeTuning {
        ProbeTuning {
            retry_delay: Duration::from_millis(self.probe.retry_delay_ms),
            request_timeout: Duration::from_millis(self.probe.request_timeout_ms),
            timeout: Duration::from_millis(self.probe.timeout_ms),
        }
    }

    /// A run spec for `image` carrying the configured run defaults.
    pub fn run_spec(&self, image: impl Into<String>) -> RunSpec {
        RunSpec {
            wait_timeout: Duration::from_millis(self.run.wait_timeout_ms),
            force_color: self.run.force_color,
            show_output: self.run.show_output,
            verbose: self.engine.verbose,
            ..RunSpec::new(image)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_from(&dir.path().join("nope.toml")).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.executor().binary(), "docker");
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[engine]\nbinary = \"podman\"\n\n[probe]\ntimeout_ms = 500\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).await.unwrap();
        assert_eq!(config.engine.binary, "podman");
        assert_eq!(config.engine.retry_delay_ms, 5000);
        assert_eq!(config.probe_tuning().timeout, Duration::from_millis(500));
        assert_eq!(config.probe_tuning().retry_delay, Duration::from_millis(1000));
        assert!(config.run.force_color);
    }

    #[tokio::test]
    async fn malformed_file_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine\nbinary = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path).await,
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> = [(ENGINE_ENV, "nerdctl"), (VERBOSE_ENV, "TRUE")]
            .into_iter()
            .collect();
        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.engine.binary, "nerdctl");
        assert!(config.engine.verbose);
        assert!(config.run_spec("img").verbose);
    }

    #[tokio::test]
    async fn explicit_path_still_takes_environment_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[engine]\nbinary = \"podman\"\nverbose = false\n").unwrap();
        let env: HashMap<&str, &str> = [(ENGINE_ENV, "nerdctl"), (VERBOSE_ENV, "1")]
            .into_iter()
            .collect();

        let config = AppConfig::load_with(Some(&path), |key| env.get(key).map(|v| v.to_string()))
            .await
            .unwrap();
        assert_eq!(config.engine.binary, "nerdctl");
        assert!(config.engine.verbose);
    }

    #[test]
    fn run_spec_carries_run_defaults() {
        let mut config = AppConfig::default();
        config.run.wait_timeout_ms = 1234;
        config.run.show_output = true;
        let spec = config.run_spec("img:tag");
        assert_eq!(spec.image, "img:tag");
        assert_eq!(spec.wait_timeout, Duration::from_millis(1234));
        assert!(spec.show_output);
        assert!(spec.detach);
    }
}
