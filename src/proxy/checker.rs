//! Probing a single proxy

use crate::proxy::models::{CheckTask, FailureReason, ProbeOutcome};
use async_trait::async_trait;
use reqwest::{Client, Proxy as ReqwestProxy};
use serde::Deserialize;
use std::error::Error as StdError;
use std::io;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default timeout for proxy checks in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default "what is my IP" endpoint to probe through each proxy
const DEFAULT_TEST_URL: &str = "https://ipinfo.io/";

/// Longest response body kept in failure diagnostics
const MAX_DETAIL_LEN: usize = 512;

/// Configuration for proxy probes
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each probe
    pub timeout: Duration,
    /// URL to request through the proxy. Must answer with a JSON object
    /// carrying a `country` field.
    pub test_url: String,
    /// Accept any certificate from the test URL. Many proxies re-sign TLS.
    pub accept_invalid_certs: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            test_url: DEFAULT_TEST_URL.to_string(),
            accept_invalid_certs: true,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_test_url(mut self, url: String) -> Self {
        self.test_url = url;
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }
}

/// Something that can probe one task.
///
/// Exactly one attempt per call, no retries.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, task: &CheckTask) -> ProbeOutcome;
}

/// Exit identity reported by the test URL
#[derive(Debug, Deserialize)]
struct IpInfo {
    country: String,
    #[serde(default)]
    city: Option<String>,
}

/// Probes proxies with a real HTTP request
#[derive(Debug, Clone, Default)]
pub struct HttpProber {
    config: CheckerConfig,
}

impl HttpProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Create a reqwest client that routes everything through the task's proxy
    fn create_client(&self, task: &CheckTask) -> Result<Client, ProbeOutcome> {
        let proxy = route_through(task, &task.proxy_url())?;

        Client::builder()
            .proxy(proxy)
            .timeout(self.config.timeout)
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ProbeOutcome::failure(task, FailureReason::OtherError, e.to_string()))
    }

    async fn fetch(&self, client: &Client) -> Result<(reqwest::StatusCode, String), reqwest::Error> {
        let response = client.get(&self.config.test_url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, task: &CheckTask) -> ProbeOutcome {
        let client = match self.create_client(task) {
            Ok(client) => client,
            Err(outcome) => return outcome,
        };

        let start = Instant::now();
        let (status, body) =
            match tokio::time::timeout(self.config.timeout, self.fetch(&client)).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    let reason = classify_error(&e);
                    debug!(proxy = %task, %reason, error = %e, "probe failed");
                    return ProbeOutcome::failure(task, reason, e.to_string());
                }
                Err(_) => {
                    debug!(proxy = %task, "probe timed out");
                    return ProbeOutcome::failure(task, FailureReason::Timeout, "timed out");
                }
            };
        let latency = start.elapsed();

        // Anything but the expected JSON means the proxy answered by itself
        // instead of forwarding the request.
        match serde_json::from_str::<IpInfo>(&body) {
            Ok(info) => {
                debug!(
                    proxy = %task,
                    latency_ms = latency.as_millis() as u64,
                    country = %info.country,
                    city = info.city.as_deref().unwrap_or("-"),
                    "probe succeeded"
                );
                ProbeOutcome::success(task, latency, info.country)
            }
            Err(e) => {
                let detail = format!(
                    "status {}: {} ({})",
                    status.as_u16(),
                    truncate(&body, MAX_DETAIL_LEN),
                    e
                );
                debug!(proxy = %task, %detail, "unexpected response");
                ProbeOutcome::failure(task, FailureReason::MalformedResponse, detail)
            }
        }
    }
}

/// Build the proxy `task` is probed through. A URL reqwest can not turn into
/// a proxy means the scheme itself is unusable here.
fn route_through(task: &CheckTask, proxy_url: &str) -> Result<ReqwestProxy, ProbeOutcome> {
    ReqwestProxy::all(proxy_url).map_err(|e| {
        // the pool reports the protocol once
        debug!(protocol = %task.protocol, error = %e, "can not build proxy");
        ProbeOutcome::failure(task, FailureReason::ProtocolUnsupported, e.to_string())
    })
}

/// Map a transport error onto a failure reason
fn classify_error(err: &reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        return FailureReason::Timeout;
    }
    if err.is_connect() {
        return FailureReason::ConnectionError;
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return match io_err.kind() {
                io::ErrorKind::TimedOut => FailureReason::Timeout,
                io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => FailureReason::ConnectionError,
                _ => FailureReason::OtherError,
            };
        }
        source = cause.source();
    }

    if err.is_decode() {
        FailureReason::MalformedResponse
    } else {
        FailureReason::OtherError
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
