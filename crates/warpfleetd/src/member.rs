//! HTTP client for the member-cluster workload API.
//!
//! A member cluster exposes each propagated workload at
//! `/workloads/{namespace}/{kind}/{name}` on its API endpoint:
//!
//! - `GET` returns `{"ready": bool, "since": u64}` (`since` optional);
//! - `DELETE` removes the workload; 404 counts as already gone.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use warpfleet_failover::WorkloadDeleter;
use warpfleet_health::checker::endpoint_address;
use warpfleet_health::{WorkloadObservation, WorkloadProbe, http_request};
use warpfleet_state::{SharedClock, StateStore, WorkloadRef};

#[derive(Debug, Deserialize)]
struct WorkloadStatusBody {
    ready: bool,
    #[serde(default)]
    since: Option<u64>,
}

/// Talks to member clusters, resolving endpoints from the state store.
pub struct MemberClient {
    state: StateStore,
    clock: SharedClock,
    timeout: Duration,
}

impl MemberClient {
    pub fn new(state: StateStore, clock: SharedClock, timeout: Duration) -> Self {
        Self { state, clock, timeout }
    }

    fn address_of(&self, cluster: &str) -> anyhow::Result<String> {
        let record = self
            .state
            .get_cluster(cluster)?
            .ok_or_else(|| anyhow!("cluster {cluster} not registered"))?;
        endpoint_address(&record.api_endpoint)
            .ok_or_else(|| anyhow!("cluster {cluster} has unusable endpoint {}", record.api_endpoint))
    }

    async fn request(&self, method: Method, cluster: &str, path: &str) -> anyhow::Result<(StatusCode, Bytes)> {
        let address = self.address_of(cluster)?;
        tokio::time::timeout(self.timeout, http_request(method.clone(), &address, path))
            .await
            .map_err(|_| anyhow!("{method} {path} on {cluster} timed out after {:?}", self.timeout))?
    }
}

pub fn workload_path(workload: &WorkloadRef) -> String {
    format!(
        "/workloads/{}/{}/{}",
        workload.namespace,
        workload.kind.to_lowercase(),
        workload.name
    )
}

#[async_trait]
impl WorkloadProbe for MemberClient {
    async fn probe(&self, workload: &WorkloadRef, cluster: &str) -> anyhow::Result<WorkloadObservation> {
        let (status, body) = self.request(Method::GET, cluster, &workload_path(workload)).await?;
        if !status.is_success() {
            bail!("workload status on {cluster} returned {status}");
        }

        let parsed: WorkloadStatusBody = serde_json::from_slice(&body).context("decode workload status")?;
        Ok(WorkloadObservation {
            ready: parsed.ready,
            since: parsed.since.unwrap_or_else(|| self.clock.now()),
        })
    }
}

#[async_trait]
impl WorkloadDeleter for MemberClient {
    async fn delete(&self, workload: &WorkloadRef, cluster: &str) -> anyhow::Result<()> {
        let (status, _) = self.request(Method::DELETE, cluster, &workload_path(workload)).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(%workload, %cluster, %status, "workload deleted");
            return Ok(());
        }
        bail!("delete of {workload} on {cluster} returned {status}")
    }
}
