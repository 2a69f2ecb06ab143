// ABOUTME: HTTP readiness prober that polls an endpoint until a success condition or timeout
// Used after a container starts to confirm its service answers (or, negatively, that it is gone)

use crate::engine::{EngineError, Result};
use reqwest::{Method, Response};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Pause between attempts.
pub const DEFAULT_PROBE_RETRY_DELAY: Duration = Duration::from_millis(1000);
/// Limit for a single request.
pub const DEFAULT_PROBE_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
/// Limit for the whole poll.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(30000);

/// What counts as success for a single probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCondition {
    /// Any HTTP response, regardless of status.
    AnyResponse,
    /// A response with exactly this status code.
    Status(u16),
    /// The request fails to get any response (connection refused, timeout).
    NoResponse,
}

/// One endpoint to poll and the condition that ends the poll.
#[derive(Debug, Clone)]
pub struct FetchProbe {
    /// Endpoint to request.
    pub url: String,
    /// `GET` unless set.
    pub method: Method,
    /// Extra request headers, sent in order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Option<String>,
    /// When an attempt counts as success.
    pub condition: FetchCondition,
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Limit for a single request.
    pub request_timeout: Duration,
    /// Limit for the whole poll.
    pub timeout: Duration,
}

impl FetchProbe {
    /// `GET url` with default timing.
    pub fn new(url: impl Into<String>, condition: FetchCondition) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            condition,
            retry_delay: DEFAULT_PROBE_RETRY_DELAY,
            request_timeout: DEFAULT_PROBE_REQUEST_TIMEOUT,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Use `method` instead of `GET`.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send `body` with every attempt.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Pause between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Limit for a single request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Limit for the whole poll.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Polling cadence shared by probes built on the caller's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTuning {
    /// Pause between attempts.
    pub retry_delay: Duration,
    /// Limit for a single request.
    pub request_timeout: Duration,
    /// Limit for the whole poll.
    pub timeout: Duration,
}

impl Default for ProbeTuning {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_PROBE_RETRY_DELAY,
            request_timeout: DEFAULT_PROBE_REQUEST_TIMEOUT,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl ProbeTuning {
    /// Overwrite the timing of `probe` with this tuning.
    pub fn apply(&self, probe: FetchProbe) -> FetchProbe {
        probe
            .with_retry_delay(self.retry_delay)
            .with_request_timeout(self.request_timeout)
            .with_timeout(self.timeout)
    }
}

#[derive(Debug)]
enum ProbeOutcome {
    /// Condition met. Carries the response when one was received.
    Satisfied(Option<Response>),
    TimedOut,
}

/// Polls HTTP endpoints with a shared client.
#[derive(Debug, Clone, Default)]
pub struct ReadinessProber {
    client: reqwest::Client,
}

impl ReadinessProber {
    /// Prober with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prober reusing `client`.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Poll until the probe condition holds. Returns `false` on overall timeout.
    pub async fn wait_for_fetch(&self, probe: &FetchProbe) -> bool {
        matches!(self.poll(probe).await, ProbeOutcome::Satisfied(_))
    }

    /// Like [`wait_for_fetch`](Self::wait_for_fetch) but hands back the
    /// successful response. `NoResponse` probes never yield one.
    pub async fn wait_for_response(&self, probe: &FetchProbe) -> Option<Response> {
        match self.poll(probe).await {
            ProbeOutcome::Satisfied(response) => response,
            ProbeOutcome::TimedOut => None,
        }
    }

    /// Like [`wait_for_fetch`](Self::wait_for_fetch) but raises `ReadinessTimeout`.
    pub async fn wait_until_ready(&self, probe: &FetchProbe) -> Result<()> {
        if self.wait_for_fetch(probe).await {
            Ok(())
        } else {
            Err(EngineError::ReadinessTimeout {
                target: format!("{} to satisfy {:?}", probe.url, probe.condition),
                timeout: probe.timeout,
            })
        }
    }

    async fn poll(&self, probe: &FetchProbe) -> ProbeOutcome {
        let started = Instant::now();
        let mut attempts = 0u32;

        while started.elapsed() < probe.timeout {
            attempts += 1;
            let elapsed = started.elapsed();

            match self.send(probe).await {
                Ok(response) => match probe.condition {
                    FetchCondition::AnyResponse => {
                        info!(
                            "URL {} responded (status: {}) after {} attempts ({:?})",
                            probe.url,
                            response.status(),
                            attempts,
                            elapsed
                        );
                        return ProbeOutcome::Satisfied(Some(response));
                    }
                    FetchCondition::Status(expected) if response.status().as_u16() == expected => {
                        info!(
                            "URL {} responded with status {} after {} attempts ({:?})",
                            probe.url, expected, attempts, elapsed
                        );
                        return ProbeOutcome::Satisfied(Some(response));
                    }
                    FetchCondition::Status(expected) => {
                        debug!(
                            "Attempt {}: got status {}, expected {} ({:?})",
                            attempts,
                            response.status(),
                            expected,
                            elapsed
                        );
                    }
                    FetchCondition::NoResponse => {
                        debug!("Attempt {}: {} still responding ({:?})", attempts, probe.url, elapsed);
                    }
                },
                Err(e) => {
                    if probe.condition == FetchCondition::NoResponse {
                        info!(
                            "URL {} is not responding (as expected) after {} attempts ({:?})",
                            probe.url, attempts, elapsed
                        );
                        return ProbeOutcome::Satisfied(None);
                    }
                    debug!("Attempt {}: request failed ({:?}): {}", attempts, elapsed, e);
                }
            }

            let remaining = probe.timeout.saturating_sub(started.elapsed());
            if !remaining.is_zero() {
                tokio::time::sleep(probe.retry_delay.min(remaining)).await;
            }
        }

        info!(
            "Timeout reached for {} after {} attempts ({:?})",
            probe.url,
            attempts,
            started.elapsed()
        );
        ProbeOutcome::TimedOut
    }

    async fn send(&self, probe: &FetchProbe) -> reqwest::Result<Response> {
        let mut request = self
            .client
            .request(probe.method.clone(), &probe.url)
            .timeout(probe.request_timeout);
        for (name, value) in &probe.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &probe.body {
            request = request.body(body.clone());
        }
        request.send().await
    }
}
