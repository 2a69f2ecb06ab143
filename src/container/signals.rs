// ABOUTME: Scoped SIGINT/SIGTERM listener that cancels a token for the duration of one run
// Dropping the scope stops its listener so repeated runs never stack handlers

use crate::engine::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// SIGINT/SIGTERM delivery mapped onto a [`CancellationToken`] for as long
/// as the scope lives.
///
/// Dropping the scope stops its listener, but the OS-level handler tokio
/// registers stays installed for the rest of the process. From then on a
/// signal no longer terminates the process by default, so any later wait that
/// should be interruptible must install its own scope (or otherwise listen for
/// the signal) and react to it.
#[derive(Debug)]
pub struct SignalScope {
    token: CancellationToken,
    listener: JoinHandle<()>,
}

impl SignalScope {
    /// Start listening. The returned token is a child of `parent`, so
    /// cancelling the parent also cancels this scope.
    pub fn install(parent: &CancellationToken) -> Result<Self> {
        let token = parent.child_token();
        let listener = spawn_listener(token.clone())?;
        Ok(Self { token, listener })
    }

    /// Token cancelled by a signal or by the parent.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a signal (or the parent) has cancelled this scope.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for SignalScope {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(unix)]
fn spawn_listener(token: CancellationToken) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = token.cancelled() => return,
        };
        warn!("Received {}, killing spawned processes...", name);
        token.cancel();
    }))
}

#[cfg(not(unix))]
fn spawn_listener(token: CancellationToken) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    warn!("Received Ctrl-C, killing spawned processes...");
                    token.cancel();
                }
            }
            _ = token.cancelled() => {}
        }
    }))
}
