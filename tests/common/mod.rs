// ABOUTME: Fake container engine for integration tests - a generated /bin/sh script per test
// Each subcommand gets a shell snippet; every invocation is appended to a calls file

#![allow(dead_code)]

use dockhand::{CliExecutor, CommandExecutor};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

pub struct FakeEngine {
    dir: TempDir,
    script: PathBuf,
}

#[derive(Default)]
pub struct FakeEngineBuilder {
    handlers: BTreeMap<String, String>,
}

impl FakeEngineBuilder {
    /// Shell body run when the engine is invoked as `<subcommand> ...`.
    /// `$DIR` points at the engine's scratch directory.
    pub fn on(mut self, subcommand: &str, body: &str) -> Self {
        self.handlers.insert(subcommand.to_string(), body.to_string());
        self
    }

    pub fn build(self) -> FakeEngine {
        let dir = TempDir::new().expect("Failed to create engine dir");
        let script = dir.path().join("fake-engine");

        let mut text = format!(
            "#!/bin/sh\nDIR='{}'\necho \"$*\" >> \"$DIR/calls\"\ncase \"$1\" in\n",
            dir.path().display()
        );
        for (subcommand, body) in &self.handlers {
            let body = if subcommand == "logs" {
                format!("echo $$ > \"$DIR/logs.pid\"\n{}", body)
            } else {
                body.clone()
            };
            text.push_str(&format!("  {})\n{}\n  ;;\n", subcommand, body));
        }
        text.push_str("  *) exit 0 ;;\nesac\n");

        std::fs::write(&script, text).expect("Failed to write engine script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod engine script");

        FakeEngine { dir, script }
    }
}

impl FakeEngine {
    pub fn builder() -> FakeEngineBuilder {
        FakeEngineBuilder::default()
            .on("run", "echo abc123")
            .on("stop", "echo stopped")
            .on("rm", "echo done")
    }

    pub fn path(&self) -> &Path {
        &self.script
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn executor(&self) -> Arc<dyn CommandExecutor> {
        Arc::new(CliExecutor::new(self.script.display().to_string()))
    }

    /// Every invocation so far, one argument string per call.
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    /// Pid of the most recent `logs` invocation.
    pub fn logs_pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.dir.path().join("logs.pid"))
            .ok()
            .and_then(|pid| pid.trim().parse().ok())
    }

    pub fn logs_process_alive(&self) -> bool {
        match self.logs_pid() {
            Some(pid) => Command::new("kill")
                .args(["-0", &pid.to_string()])
                .status()
                .map(|status| status.success())
                .unwrap_or(false),
            None => false,
        }
    }
}
