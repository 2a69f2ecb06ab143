// ABOUTME: RunSpec describes one container launch and renders it into engine `run` arguments
// Specs are immutable once built; per-run changes go through derive() which copies and overrides

use super::command::tokenize;
use crate::engine::{EngineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Readiness wait used when none is given.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(30000);
const FORCE_COLOR: &str = "FORCE_COLOR";

/// A published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the container.
    pub internal: u16,
    /// Port on the host, probed by `is_running`.
    pub external: u16,
}

impl PortMapping {
    /// Map host `external` to container `internal`.
    pub fn new(internal: u16, external: u16) -> Self {
        Self { internal, external }
    }

    /// Rendered as `external:internal` for `-p`.
    pub fn to_flag_value(&self) -> String {
        format!("{}:{}", self.external, self.internal)
    }
}

/// Everything needed to launch one container and decide when it is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSpec {
    /// Image reference, required.
    pub image: String,
    /// Container name (`--name`).
    pub name: Option<String>,
    /// Published ports; the first one is probed by `is_running`.
    pub ports: Vec<PortMapping>,
    /// `-v` values, passed through verbatim.
    pub volumes: Vec<String>,
    /// Container environment, rendered sorted by key.
    pub env: BTreeMap<String, String>,
    /// Run with `-d`. Forced on when waiting for a pattern.
    pub detach: bool,
    /// `--rm`.
    pub remove_on_exit: bool,
    /// Keep stdin open (`-i`).
    pub interactive: bool,
    /// Allocate a pseudo-TTY (`-t`).
    pub tty: bool,
    /// Working directory inside the container (`-w`).
    pub workdir: Option<String>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Target platform, e.g. `linux/amd64`.
    pub platform: Option<String>,
    /// Shell-style command line, split into arguments after the image.
    pub command: Option<String>,
    /// Regular expression matched against log lines to decide readiness.
    pub wait_for: Option<String>,
    /// How long to wait for `wait_for`.
    #[serde(with = "millis")]
    pub wait_timeout: Duration,
    /// Inject `FORCE_COLOR=1` unless the env already sets it.
    pub force_color: bool,
    /// Echo container output and keep following it after readiness.
    pub show_output: bool,
    /// Echo output while waiting, without following afterwards.
    pub verbose: bool,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            image: String::new(),
            name: None,
            ports: Vec::new(),
            volumes: Vec::new(),
            env: BTreeMap::new(),
            detach: true,
            remove_on_exit: false,
            interactive: false,
            tty: false,
            workdir: None,
            network: None,
            platform: None,
            command: None,
            wait_for: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            force_color: true,
            show_output: false,
            verbose: false,
        }
    }
}

/// Field-by-field overrides applied by [`RunSpec::derive`]. Each `Some`
/// replaces the [`RunSpec`] field of the same name.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct RunOverrides {
    pub image: Option<String>,
    pub name: Option<String>,
    pub ports: Option<Vec<PortMapping>>,
    pub volumes: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub detach: Option<bool>,
    pub remove_on_exit: Option<bool>,
    pub interactive: Option<bool>,
    pub tty: Option<bool>,
    pub workdir: Option<String>,
    pub network: Option<String>,
    pub platform: Option<String>,
    pub command: Option<String>,
    pub wait_for: Option<String>,
    pub wait_timeout: Option<Duration>,
    pub force_color: Option<bool>,
    pub show_output: Option<bool>,
    pub verbose: Option<bool>,
}

impl RunSpec {
    /// Defaults plus `image`.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Set the container name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Publish container port `internal` on host port `external`.
    pub fn with_port(mut self, internal: u16, external: u16) -> Self {
        self.ports.push(PortMapping::new(internal, external));
        self
    }

    /// Add a `-v` mount.
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    /// Set one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command run in place of the image default.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Wait for `pattern` in the logs, for at most `timeout`.
    pub fn with_wait_for(mut self, pattern: impl Into<String>, timeout: Duration) -> Self {
        self.wait_for = Some(pattern.into());
        self.wait_timeout = timeout;
        self
    }

    /// Toggle `-d`.
    pub fn with_detach(mut self, detach: bool) -> Self {
        self.detach = detach;
        self
    }

    /// Toggle echoing and following output.
    pub fn with_show_output(mut self, show_output: bool) -> Self {
        self.show_output = show_output;
        self
    }

    /// Copy this spec with the given overrides applied. `self` is untouched.
    pub fn derive(&self, overrides: RunOverrides) -> RunSpec {
        let base = self.clone();
        RunSpec {
            image: overrides.image.unwrap_or(base.image),
            name: overrides.name.or(base.name),
            ports: overrides.ports.unwrap_or(base.ports),
            volumes: overrides.volumes.unwrap_or(base.volumes),
            env: overrides.env.unwrap_or(base.env),
            detach: overrides.detach.unwrap_or(base.detach),
            remove_on_exit: overrides.remove_on_exit.unwrap_or(base.remove_on_exit),
            interactive: overrides.interactive.unwrap_or(base.interactive),
            tty: overrides.tty.unwrap_or(base.tty),
            workdir: overrides.workdir.or(base.workdir),
            network: overrides.network.or(base.network),
            platform: overrides.platform.or(base.platform),
            command: overrides.command.or(base.command),
            wait_for: overrides.wait_for.or(base.wait_for),
            wait_timeout: overrides.wait_timeout.unwrap_or(base.wait_timeout),
            force_color: overrides.force_color.unwrap_or(base.force_color),
            show_output: overrides.show_output.unwrap_or(base.show_output),
            verbose: overrides.verbose.unwrap_or(base.verbose),
        }
    }

    /// An image is the only hard requirement.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(EngineError::Configuration(
                "no image configured for container run".to_string(),
            ));
        }
        Ok(())
    }

    /// Compiled readiness pattern, if one is configured.
    pub fn readiness_pattern(&self) -> Result<Option<Regex>> {
        match &self.wait_for {
            Some(pattern) => Ok(Some(Regex::new(pattern)?)),
            None => Ok(None),
        }
    }

    /// Environment with `FORCE_COLOR=1` injected unless disabled or already set.
    pub fn effective_env(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if self.force_color && !env.contains_key(FORCE_COLOR) {
            env.insert(FORCE_COLOR.to_string(), "1".to_string());
        }
        env
    }

    /// Full engine argument vector, starting with `run`.
    pub fn to_args(&self) -> Result<Vec<String>> {
        self.render_args(self.detach)
    }

    /// Same as [`to_args`](Self::to_args) but always detached, used when the
    /// container id is needed before waiting on logs.
    pub fn to_detached_args(&self) -> Result<Vec<String>> {
        self.render_args(true)
    }

    fn render_args(&self, detach: bool) -> Result<Vec<String>> {
        self.validate()?;

        let mut args = vec!["run".to_string()];
        if detach {
            args.push("-d".to_string());
        }
        if self.remove_on_exit {
            args.push("--rm".to_string());
        }
        if self.interactive {
            args.push("-i".to_string());
        }
        if self.tty {
            args.push("-t".to_string());
        }
        if let Some(name) = &self.name {
            args.extend(["--name".to_string(), name.clone()]);
        }
        if let Some(workdir) = &self.workdir {
            args.extend(["-w".to_string(), workdir.clone()]);
        }
        if let Some(network) = &self.network {
            args.extend(["--network".to_string(), network.clone()]);
        }
        if let Some(platform) = &self.platform {
            args.extend(["--platform".to_string(), platform.clone()]);
        }
        for port in &self.ports {
            args.extend(["-p".to_string(), port.to_flag_value()]);
        }
        for volume in &self.volumes {
            args.extend(["-v".to_string(), volume.clone()]);
        }
        for (key, value) in self.effective_env() {
            args.extend(["-e".to_string(), format!("{}={}", key, value)]);
        }
        args.push(self.image.clone());

        if let Some(command) = &self.command {
            args.extend(tokenize(command)?);
        }

        Ok(args)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
