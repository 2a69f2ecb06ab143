// ABOUTME: Thin wrapper over the engine's `ps` command for listing containers

use super::error::Result;
use super::executor::{CommandExecutor, ExecOptions};
use serde_json::Value;

/// Flags for `ps`.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Include stopped containers (`-a`).
    pub all: bool,
    /// Passed as `--filter`, e.g. `ancestor=img:tag`.
    pub filter: Option<String>,
    /// Go template for `--format`; wins over `json`.
    pub format: Option<String>,
    /// Ask for one JSON object per line.
    pub json: bool,
}

impl ListOptions {
    /// Every container, running or not.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    /// Set the `--filter` expression.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Set the `--format` template.
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Request JSON-lines output.
    pub fn as_json(mut self) -> Self {
        self.json = true;
        self
    }

    /// JSON output only applies when no explicit format template was given.
    fn wants_json(&self) -> bool {
        self.json && self.format.is_none()
    }

    /// Render the `ps` argument vector.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["ps".to_string()];
        if self.all {
            args.push("-a".to_string());
        }
        if let Some(filter) = &self.filter {
            args.push("--filter".to_string());
            args.push(filter.clone());
        }
        if self.wants_json() {
            args.push("--format".to_string());
            args.push("json".to_string());
        } else if let Some(format) = &self.format {
            args.push("--format".to_string());
            args.push(format.clone());
        }
        args
    }
}

/// Output of [`list_containers`].
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerListing {
    /// Raw text as the engine printed it.
    Text(String),
    /// One value per non-empty output line.
    Json(Vec<Value>),
}

impl ContainerListing {
    /// Text as-is, or JSON rows re-serialized one per line.
    pub fn into_text(self) -> String {
        match self {
            ContainerListing::Text(text) => text,
            ContainerListing::Json(rows) => rows
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Run `ps` with `options`, parsing JSON-lines output when requested.
pub async fn list_containers(
    executor: &dyn CommandExecutor,
    options: &ListOptions,
) -> Result<ContainerListing> {
    let output = executor.execute(&options.to_args(), &ExecOptions::new()).await?;

    if options.wants_json() {
        let rows = output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<Vec<Value>, _>>()?;
        return Ok(ContainerListing::Json(rows));
    }

    Ok(ContainerListing::Text(output))
}
