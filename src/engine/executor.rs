// ABOUTME: Command executor that drives the container engine CLI with retry/backoff
// All engine invocations go through CommandExecutor so collaborators can be swapped in tests

use super::error::{EngineError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Pause between attempts unless the caller picks another.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(5000);
const RETRY_TRUE_ATTEMPTS: u32 = 3;

/// How many times a command is attempted and how long to sleep in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one.
    pub attempts: u32,
    /// Sleep between failed attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::attempts(1)
    }
}

impl RetryPolicy {
    /// Attempt count is clamped to at least one.
    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Sleep `delay` between attempts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry {
            Self::attempts(RETRY_TRUE_ATTEMPTS)
        } else {
            Self::attempts(1)
        }
    }
}

impl From<u32> for RetryPolicy {
    fn from(attempts: u32) -> Self {
        Self::attempts(attempts)
    }
}

/// Per-call options for [`CommandExecutor::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// `true` maps to three attempts, a number to that many.
    pub retry: RetryPolicy,
    /// Piped to the command's stdin, then closed.
    pub stdin: Option<String>,
}

impl ExecOptions {
    /// Single attempt, no stdin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps any delay set earlier.
    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        let delay = self.retry.delay;
        self.retry = retry.into().with_delay(delay);
        self
    }

    /// Override the pause between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.delay = delay;
        self
    }

    /// Text written to the command's stdin.
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// A long-lived engine subprocess (container launch, `logs -f`).
///
/// The child is spawned with `kill_on_drop`, so dropping an `EngineProcess`
/// on any exit path terminates the subprocess.
#[derive(Debug)]
pub struct EngineProcess {
    command: String,
    child: Child,
}

impl EngineProcess {
    /// Rendered command line, for logs and errors.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Hand the stdout pipe to a reader; `None` once taken.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Same as [`take_stdout`](Self::take_stdout) for stderr.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Whether the process has already exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Drain both pipes and wait for exit. Non-zero exit becomes `CommandFailed`.
    pub async fn output(&mut self) -> Result<String> {
        let mut stdout = self.take_stdout();
        let mut stderr = self.take_stderr();

        let read_stdout = async {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                out.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                err.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };

        let (out, err) = tokio::try_join!(read_stdout, read_stderr)?;
        let status = self.child.wait().await?;

        if !status.success() {
            return Err(EngineError::CommandFailed {
                command: self.command.clone(),
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&err).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Kill the process if it is still running. Already-exited processes are fine.
    pub async fn kill(&mut self) {
        if self.has_exited() {
            return;
        }
        if let Err(e) = self.child.kill().await {
            debug!("Failed to kill `{}`: {}", self.command, e);
        }
    }
}

/// Seam between the orchestration logic and the engine binary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run one engine command to completion, returning trimmed stdout.
    async fn execute(&self, args: &[String], options: &ExecOptions) -> Result<String>;

    /// Start an engine command with piped stdout/stderr and return immediately.
    fn spawn(&self, args: &[String]) -> Result<EngineProcess>;
}

/// Drives a container engine binary (`docker` by default).
#[derive(Debug, Clone)]
pub struct CliExecutor {
    binary: String,
    verbose: bool,
}

impl Default for CliExecutor {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl CliExecutor {
    /// Engine resolved through PATH, e.g. `docker` or `podman`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            verbose: false,
        }
    }

    /// Log every invocation at info level instead of debug.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// The configured engine binary.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn describe(&self, args: &[String]) -> String {
        if args.is_empty() {
            self.binary.clone()
        } else {
            format!("{} {}", self.binary, args.join(" "))
        }
    }

    fn trace_invocation(&self, command: &str) {
        if self.verbose {
            info!("[engine] Executing: {}", command);
        } else {
            debug!(command = %command, "executing engine command");
        }
    }

    async fn execute_once(&self, args: &[String], stdin: Option<&str>) -> Result<String> {
        let command = self.describe(args);

        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            // Closing the pipe signals EOF to the engine
            drop(pipe);
        }

        let output = child.wait_with_output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(EngineError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl CommandExecutor for CliExecutor {
    async fn execute(&self, args: &[String], options: &ExecOptions) -> Result<String> {
        let command = self.describe(args);
        self.trace_invocation(&command);

        let attempts = options.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.execute_once(args, options.stdin.as_deref()).await {
                Ok(output) => return Ok(output),
                Err(e @ EngineError::CommandFailed { .. }) if attempt < attempts => {
                    warn!(
                        "Command `{}` failed (attempt {}/{}), retrying in {:?}: {}",
                        command, attempt, attempts, options.retry.delay, e
                    );
                    tokio::time::sleep(options.retry.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn spawn(&self, args: &[String]) -> Result<EngineProcess> {
        let command = self.describe(args);
        self.trace_invocation(&command);

        let child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        Ok(EngineProcess { command, child })
    }
}

/// Convert borrowed string literals into an owned argument vector.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn sh() -> CliExecutor {
        CliExecutor::new("sh")
    }

    #[test]
    fn retry_policy_from_bool_and_count() {
        assert_eq!(RetryPolicy::from(true).attempts, 3);
        assert_eq!(RetryPolicy::from(false).attempts, 1);
        assert_eq!(RetryPolicy::from(0).attempts, 1);
        assert_eq!(RetryPolicy::from(4).attempts, 4);
        assert_eq!(RetryPolicy::default().delay, DEFAULT_RETRY_DELAY);
    }

    #[test]
    fn with_retry_keeps_configured_delay() {
        let opts = ExecOptions::new()
            .with_retry_delay(Duration::from_millis(100))
            .with_retry(2);
        assert_eq!(opts.retry.attempts, 2);
        assert_eq!(opts.retry.delay, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn execute_returns_trimmed_stdout() {
        let out = sh()
            .execute(&argv(["-c", "printf '  hello\\n\\n'"]), &ExecOptions::new())
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn execute_pipes_stdin() {
        let out = sh()
            .execute(&argv(["-c", "cat"]), &ExecOptions::new().with_stdin("secret"))
            .await
            .unwrap();
        assert_eq!(out, "secret");
    }

    #[tokio::test]
    async fn execute_failure_carries_stderr() {
        let err = sh()
            .execute(&argv(["-c", "echo nope >&2; exit 3"]), &ExecOptions::new())
            .await
            .unwrap_err();
        match err {
            EngineError::CommandFailed { stderr, status, .. } => {
                assert_eq!(stderr, "nope");
                assert!(status.contains('3'));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_retries_after_one_failure() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("attempted");
        let script = format!(
            "if [ -f '{m}' ]; then echo ok; else touch '{m}'; echo first >&2; exit 1; fi",
            m = marker.display()
        );

        let opts = ExecOptions::new()
            .with_retry(2)
            .with_retry_delay(Duration::from_millis(100));
        let started = Instant::now();
        let out = sh().execute(&argv(["-c", script.as_str()]), &opts).await.unwrap();

        assert_eq!(out, "ok");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn execute_gives_up_after_attempts() {
        let opts = ExecOptions::new()
            .with_retry(2)
            .with_retry_delay(Duration::from_millis(10));
        let err = sh()
            .execute(&argv(["-c", "echo always >&2; exit 1"]), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed { ref stderr, .. } if stderr == "always"));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = CliExecutor::new("definitely-not-an-engine-binary")
            .execute(&argv(["version"]), &ExecOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }

    #[tokio::test]
    async fn spawned_process_output_and_kill() {
        let mut proc = sh().spawn(&argv(["-c", "echo spawned"])).unwrap();
        assert_eq!(proc.output().await.unwrap(), "spawned");

        let mut sleeper = sh().spawn(&argv(["-c", "sleep 30"])).unwrap();
        assert!(!sleeper.has_exited());
        sleeper.kill().await;
        assert!(sleeper.has_exited());
    }
}
