//! Cluster probe logic.
//!
//! Probes a member cluster's readiness endpoint and debounces the raw
//! results with consecutive-failure/success thresholds and exponential
//! backoff, so that a single dropped packet does not flip the cluster's
//! Ready condition.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use warpfleet_state::{ClusterRecord, ConditionStatus};

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The readiness endpoint returned 2xx.
    Healthy,
    /// The cluster answered but reported not-ready (non-2xx).
    Unhealthy,
    /// The probe could not reach the cluster (connection error, timeout).
    Failed,
}

/// Reachability/readiness pair as seen by one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterHealth {
    pub reachable: bool,
    pub ready: bool,
}

impl From<ProbeResult> for ClusterHealth {
    fn from(result: ProbeResult) -> Self {
        match result {
            ProbeResult::Healthy => Self {
                reachable: true,
                ready: true,
            },
            ProbeResult::Unhealthy => Self {
                reachable: true,
                ready: false,
            },
            ProbeResult::Failed => Self {
                reachable: false,
                ready: false,
            },
        }
    }
}

/// Probes one member cluster.
#[async_trait]
pub trait ClusterProbe: Send + Sync {
    async fn probe(&self, cluster: &ClusterRecord) -> ProbeResult;
}

/// Longest delay between probes of a failing cluster.
const DELAY_CAP: Duration = Duration::from_secs(60);

const USER_AGENT: &str = concat!("warpfleet/", env!("CARGO_PKG_VERSION"));

/// Debounces raw probe results for one cluster.
///
/// The Ready status only moves once `failure_threshold` bad probes (or
/// `success_threshold` good ones) arrive in a row. While the cluster keeps
/// failing, the delay before the next probe doubles up to one minute.
#[derive(Debug)]
pub struct HealthTracker {
    status: Option<ConditionStatus>,
    failure_streak: u32,
    success_streak: u32,
    failure_threshold: u32,
    success_threshold: u32,
    base_delay: Duration,
    probe_delay: Duration,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32, success_threshold: u32, interval: Duration) -> Self {
        Self {
            status: None,
            failure_streak: 0,
            success_streak: 0,
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            base_delay: interval,
            probe_delay: interval,
        }
    }

    /// Record a probe result and return the debounced Ready status.
    pub fn record(&mut self, result: ProbeResult) -> Option<ConditionStatus> {
        let candidate = if result == ProbeResult::Healthy {
            self.failure_streak = 0;
            self.success_streak += 1;
            self.probe_delay = self.base_delay;
            (self.success_streak >= self.success_threshold).then_some(ConditionStatus::True)
        } else {
            self.success_streak = 0;
            self.failure_streak += 1;
            self.probe_delay = self.probe_delay.saturating_mul(2).min(DELAY_CAP);
            (self.failure_streak >= self.failure_threshold).then_some(match result {
                ProbeResult::Unhealthy => ConditionStatus::False,
                _ => ConditionStatus::Unknown,
            })
        };

        if let Some(next) = candidate
            && self.status != Some(next)
        {
            match next {
                ConditionStatus::True => debug!(streak = self.success_streak, "cluster ready again"),
                _ => warn!(
                    streak = self.failure_streak,
                    threshold = self.failure_threshold,
                    status = ?next,
                    "cluster readiness lost"
                ),
            }
            self.status = Some(next);
        }

        self.status
    }

    pub fn status(&self) -> Option<ConditionStatus> {
        self.status
    }

    /// Bad probes seen since the last good one.
    pub fn consecutive_failures(&self) -> u32 {
        self.failure_streak
    }

    pub fn next_interval(&self) -> Duration {
        self.probe_delay
    }
}

/// Probes `GET {api_endpoint}{path}` over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpClusterProbe {
    pub path: String,
    pub timeout: Duration,
}

impl HttpClusterProbe {
    pub fn new(path: &str, timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ClusterProbe for HttpClusterProbe {
    async fn probe(&self, cluster: &ClusterRecord) -> ProbeResult {
        let Some(address) = endpoint_address(&cluster.api_endpoint) else {
            warn!(cluster = %cluster.name, endpoint = %cluster.api_endpoint, "unusable cluster endpoint");
            return ProbeResult::Failed;
        };
        http_probe(&address, &self.path, self.timeout).await
    }
}

/// Extract `host:port` from an endpoint such as `http://10.0.0.1:8080/`.
pub fn endpoint_address(endpoint: &str) -> Option<String> {
    let uri: http::Uri = endpoint.parse().ok()?;
    let authority = uri.authority()?;
    let port = authority.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Some(format!("{}:{port}", authority.host()))
}

/// Send a bodiless request to `address` (`host:port`) on a fresh HTTP/1
/// connection and collect the response body.
pub async fn http_request(method: Method, address: &str, path: &str) -> anyhow::Result<(StatusCode, Bytes)> {
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("connect {address}"))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .with_context(|| format!("http handshake with {address}"))?;
    tokio::spawn(conn);

    let request = http::Request::builder()
        .method(method)
        .uri(format!("http://{address}{path}"))
        .header(header::HOST, address)
        .header(header::USER_AGENT, USER_AGENT)
        .body(Empty::<Bytes>::new())?;
    let response = sender
        .send_request(request)
        .await
        .with_context(|| format!("request {path} on {address}"))?;

    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, body))
}

/// Readiness probe against `address`: 2xx is `Healthy`, any other status
/// is `Unhealthy`, and transport errors or timeouts are `Failed`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, http_request(Method::GET, address, path)).await {
        Ok(Ok((status, _))) if status.is_success() => ProbeResult::Healthy,
        Ok(Ok((status, _))) => {
            debug!(%address, %path, %status, "cluster reported not ready");
            ProbeResult::Unhealthy
        }
        Ok(Err(e)) => {
            debug!(%address, %path, error = %e, "cluster probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%address, %path, ?timeout, "cluster probe timed out");
            ProbeResult::Failed
        }
    }
}
