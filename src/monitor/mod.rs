// ABOUTME: Log stream monitor that splits engine output into lines and watches for a readiness pattern
// Both output streams of a `logs -f` process are read concurrently; the first match across them wins

use crate::engine::EngineProcess;
use regex::Regex;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_CHUNK: usize = 8192;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// One decoded line from a container's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Container the line belongs to.
    pub container_id: String,
    /// Stream the line was read from.
    pub stream: StreamKind,
    /// Line text without its terminator.
    pub line: String,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stream, self.line)
    }
}

/// Incremental newline splitter.
///
/// Bytes are buffered until a `\n` arrives, so multi-byte UTF-8 sequences
/// split across chunks decode correctly. A trailing `\r` is dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    /// An empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            lines.push(decode_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Flush the incomplete trailing fragment, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Single-resolution latch: the first `resolve` wins, later ones are no-ops.
#[derive(Debug, Clone)]
pub struct MatchLatch {
    tx: Arc<watch::Sender<Option<LogEvent>>>,
}

impl Default for MatchLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchLatch {
    /// An unresolved latch.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true when this call was the one that resolved the latch.
    pub fn resolve(&self, event: LogEvent) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(event);
                true
            }
        })
    }

    /// Whether a match has been recorded.
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The winning event, if any.
    pub fn matched(&self) -> Option<LogEvent> {
        self.tx.borrow().clone()
    }

    /// Wait until some monitor resolves the latch.
    pub async fn resolved(&self) -> LogEvent {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(event) = rx.borrow_and_update().clone() {
                return event;
            }
            if rx.changed().await.is_err() {
                // Unreachable while self holds the sender
                std::future::pending::<()>().await;
            }
        }
    }
}

/// What a stream monitor does with each line.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Stamped on every emitted [`LogEvent`].
    pub container_id: String,
    /// Readiness pattern; `None` just drains the stream.
    pub pattern: Option<Regex>,
    /// Print lines to stdout as they arrive.
    pub echo: bool,
    /// Tag used when echoing, e.g. `container` renders `[container:stdout] ...`.
    pub echo_prefix: &'static str,
    /// Keep reading after the match instead of returning.
    pub continue_after_match: bool,
    /// Receives every line, matched or not.
    pub capture: Option<mpsc::UnboundedSender<LogEvent>>,
}

impl MonitorOptions {
    /// No pattern, no echo, no capture.
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            pattern: None,
            echo: false,
            echo_prefix: "container",
            continue_after_match: false,
            capture: None,
        }
    }

    /// Watch for `pattern`.
    pub fn with_pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Echo lines tagged with `prefix`.
    pub fn with_echo(mut self, echo: bool, prefix: &'static str) -> Self {
        self.echo = echo;
        self.echo_prefix = prefix;
        self
    }

    /// Keep reading after the first match (for continued output).
    pub fn continue_after_match(mut self, keep_going: bool) -> Self {
        self.continue_after_match = keep_going;
        self
    }

    /// Forward every line to `capture`.
    pub fn with_capture(mut self, capture: mpsc::UnboundedSender<LogEvent>) -> Self {
        self.capture = Some(capture);
        self
    }
}

/// How a single stream monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// This stream produced the winning match and stopped reading early.
    Matched,
    /// The stream reached end-of-file.
    Exhausted,
}

/// Read `reader` line by line until EOF or (unless continuing) the first match.
pub async fn monitor_stream<R>(
    mut reader: R,
    stream: StreamKind,
    options: &MonitorOptions,
    latch: &MatchLatch,
) -> io::Result<StreamEnd>
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if let Some(line) = splitter.finish() {
                if handle_line(line, stream, options, latch) && !options.continue_after_match {
                    return Ok(StreamEnd::Matched);
                }
            }
            return Ok(StreamEnd::Exhausted);
        }

        for line in splitter.push(&chunk[..n]) {
            if handle_line(line, stream, options, latch) && !options.continue_after_match {
                return Ok(StreamEnd::Matched);
            }
        }
    }
}

/// Echo, capture, and test one line. True if this line resolved the latch.
fn handle_line(line: String, stream: StreamKind, options: &MonitorOptions, latch: &MatchLatch) -> bool {
    if options.echo {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "[{}:{}] {}", options.echo_prefix, stream, line);
    }

    let event = LogEvent {
        container_id: options.container_id.clone(),
        stream,
        line,
    };

    let won = match &options.pattern {
        Some(pattern) if !latch.is_resolved() && pattern.is_match(&event.line) => {
            latch.resolve(event.clone())
        }
        _ => false,
    };

    if let Some(capture) = &options.capture {
        let _ = capture.send(event);
    }

    won
}

/// A spawned stream reader that is aborted when dropped.
#[derive(Debug)]
struct StreamTask(Option<JoinHandle<io::Result<StreamEnd>>>);

impl StreamTask {
    async fn join(&mut self) -> io::Result<Option<StreamEnd>> {
        let Some(handle) = self.0.as_mut() else {
            return Ok(None);
        };
        let result = handle.await;
        self.0 = None;
        match result {
            Ok(end) => end.map(Some),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }

    fn abort(&self) {
        if let Some(handle) = &self.0 {
            handle.abort();
        }
    }
}

impl Drop for StreamTask {
    fn drop(&mut self) {
        self.abort();
    }
}

fn spawn_stream<R>(
    reader: Option<R>,
    stream: StreamKind,
    options: &MonitorOptions,
    latch: &MatchLatch,
) -> StreamTask
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        return StreamTask(None);
    };
    let options = options.clone();
    let latch = latch.clone();
    StreamTask(Some(tokio::spawn(async move {
        let result = monitor_stream(reader, stream, &options, &latch).await;
        if let Err(e) = &result {
            if latch.is_resolved() {
                warn!(
                    "Error in background log monitoring for {} ({}): {}",
                    options.container_id, stream, e
                );
            }
        }
        result
    })))
}

/// Concurrent monitoring of both output streams of one engine process.
///
/// Owns the process; [`shutdown`](Self::shutdown) kills it, and dropping the
/// monitor kills it as well.
#[derive(Debug)]
pub struct ProcessMonitor {
    process: EngineProcess,
    latch: MatchLatch,
    stdout: StreamTask,
    stderr: StreamTask,
}

impl ProcessMonitor {
    /// Take both pipes of `process` and start reading them.
    pub fn start(mut process: EngineProcess, options: MonitorOptions) -> Self {
        let latch = MatchLatch::new();
        let stdout = spawn_stream(process.take_stdout(), StreamKind::Stdout, &options, &latch);
        let stderr = spawn_stream(process.take_stderr(), StreamKind::Stderr, &options, &latch);
        debug!("Monitoring output of `{}`", process.command());
        Self {
            process,
            latch,
            stdout,
            stderr,
        }
    }

    /// Shared latch both stream tasks resolve.
    pub fn latch(&self) -> MatchLatch {
        self.latch.clone()
    }

    /// Resolves once both streams have stopped, reporting the first read error.
    ///
    /// Cancel-safe: a stream already joined is not awaited again.
    pub async fn streams_ended(&mut self) -> io::Result<()> {
        self.stdout.join().await?;
        self.stderr.join().await?;
        Ok(())
    }

    /// Kill the process and stop reading.
    pub async fn shutdown(mut self) {
        self.process.kill().await;
        self.stdout.abort();
        self.stderr.abort();
    }

    /// Kill the process, then give buffered output up to `grace` to drain.
    pub async fn drain(mut self, grace: std::time::Duration) {
        self.process.kill().await;
        if tokio::time::timeout(grace, self.streams_ended()).await.is_err() {
            debug!("Log collection did not finish within {:?}", grace);
        }
    }

    /// Keep following output after this call returns. The returned guard owns
    /// the process; dropping it stops everything.
    pub fn into_background(self) -> LogFollower {
        LogFollower {
            process: self.process,
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Background log following that continues after readiness was reached.
#[derive(Debug)]
pub struct LogFollower {
    process: EngineProcess,
    stdout: StreamTask,
    stderr: StreamTask,
}

impl LogFollower {
    /// Wait for the followed streams to end (the container exited or was stopped).
    pub async fn wait(mut self) {
        join_streams(&mut self.stdout, &mut self.stderr).await;
    }

    /// Follow until the streams end or `token` is cancelled, whichever comes
    /// first. Returns `false` when cancelled; the log process is killed then.
    pub async fn follow_until(self, token: &CancellationToken) -> bool {
        let Self {
            mut process,
            mut stdout,
            mut stderr,
        } = self;
        let ended = tokio::select! {
            biased;
            _ = token.cancelled() => false,
            _ = join_streams(&mut stdout, &mut stderr) => true,
        };
        if !ended {
            debug!("Stopped following {}", process.command());
            process.kill().await;
        }
        ended
    }

    /// Kill the log process.
    pub async fn stop(mut self) {
        self.process.kill().await;
    }
}

async fn join_streams(stdout: &mut StreamTask, stderr: &mut StreamTask) {
    for task in [stdout, stderr] {
        if let Err(e) = task.join().await {
            warn!("Error in background log monitoring: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(stream: StreamKind, line: &str) -> LogEvent {
        LogEvent {
            container_id: "c1".to_string(),
            stream,
            line: line.to_string(),
        }
    }

    #[test]
    fn splitter_buffers_partial_lines() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"boo").is_empty());
        assert_eq!(splitter.push(b"ting\nRE"), vec!["booting"]);
        assert_eq!(splitter.push(b"ADY\r\nnext\n"), vec!["READY", "next"]);
        assert_eq!(splitter.push(b"tail"), Vec::<String>::new());
        assert_eq!(splitter.finish().as_deref(), Some("tail"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_handles_utf8_split_across_chunks() {
        let bytes = "héllo\n".as_bytes();
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(&bytes[..2]).is_empty());
        assert_eq!(splitter.push(&bytes[2..]), vec!["héllo"]);
    }

    #[test]
    fn latch_first_writer_wins() {
        let latch = MatchLatch::new();
        assert!(!latch.is_resolved());
        assert!(latch.resolve(event(StreamKind::Stderr, "first")));
        assert!(!latch.resolve(event(StreamKind::Stdout, "second")));
        assert_eq!(latch.matched().unwrap().line, "first");
    }

    #[tokio::test]
    async fn latch_wakes_waiters() {
        let latch = MatchLatch::new();
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.resolved().await })
        };
        tokio::task::yield_now().await;
        latch.resolve(event(StreamKind::Stdout, "READY"));
        assert_eq!(waiter.await.unwrap().line, "READY");
    }

    #[tokio::test]
    async fn monitor_stops_at_first_match() {
        let input: &[u8] = b"booting\nREADY now\nafter\n";
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = MonitorOptions::new("c1")
            .with_pattern(Regex::new("READY").unwrap())
            .with_capture(tx);
        let latch = MatchLatch::new();

        let end = monitor_stream(input, StreamKind::Stdout, &options, &latch)
            .await
            .unwrap();
        drop(options);

        assert_eq!(end, StreamEnd::Matched);
        assert_eq!(latch.matched().unwrap().line, "READY now");
        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev.line);
        }
        assert_eq!(seen, vec!["booting", "READY now"]);
    }

    #[tokio::test]
    async fn monitor_continues_after_match_when_asked() {
        let input: &[u8] = b"READY\nREADY again\nlast";
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = MonitorOptions::new("c1")
            .with_pattern(Regex::new("READY").unwrap())
            .continue_after_match(true)
            .with_capture(tx);
        let latch = MatchLatch::new();

        let end = monitor_stream(input, StreamKind::Stderr, &options, &latch)
            .await
            .unwrap();
        drop(options);

        assert_eq!(end, StreamEnd::Exhausted);
        assert_eq!(latch.matched().unwrap().line, "READY");
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn trailing_fragment_can_match() {
        let input: &[u8] = b"booting\nREADY";
        let options = MonitorOptions::new("c1").with_pattern(Regex::new("^READY$").unwrap());
        let latch = MatchLatch::new();
        let end = monitor_stream(input, StreamKind::Stdout, &options, &latch)
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Matched);
    }

    #[tokio::test]
    async fn stream_without_match_is_exhausted() {
        let input: &[u8] = b"booting\nstill booting\n";
        let options = MonitorOptions::new("c1").with_pattern(Regex::new("READY").unwrap());
        let latch = MatchLatch::new();
        let end = monitor_stream(input, StreamKind::Stdout, &options, &latch)
            .await
            .unwrap();
        assert_eq!(end, StreamEnd::Exhausted);
        assert!(!latch.is_resolved());
    }

    #[tokio::test]
    async fn resolved_latch_is_not_overwritten_by_other_stream() {
        let latch = MatchLatch::new();
        latch.resolve(event(StreamKind::Stderr, "READY from stderr"));

        let input: &[u8] = b"READY from stdout\n";
        let options = MonitorOptions::new("c1").with_pattern(Regex::new("READY").unwrap());
        let end = monitor_stream(input, StreamKind::Stdout, &options, &latch)
            .await
            .unwrap();

        assert_eq!(end, StreamEnd::Exhausted);
        assert_eq!(latch.matched().unwrap().stream, StreamKind::Stderr);
    }
}
