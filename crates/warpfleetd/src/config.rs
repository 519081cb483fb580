//! warpfleet.toml configuration parser.
//!
//! Every section is optional; missing keys fall back to the defaults
//! below. Durations are written as "500ms", "5s", "2m" or "1h".

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Deserializer};

use warpfleet_failover::{ControllerConfig, PurgeBackoff, RetryConfig, TaintConfig};
use warpfleet_health::{HttpClusterProbe, MonitorConfig};
use warpfleet_state::{Binding, ClusterRecord, PlacementPolicy, PurgeMode, Taint, WorkloadRef};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub controller: ControllerSection,
    pub probe: ProbeSection,
    pub purge: PurgeSection,
    pub taints: TaintSection,
    #[serde(rename = "cluster")]
    pub clusters: Vec<ClusterSeed>,
    #[serde(rename = "policy")]
    pub policies: Vec<PlacementPolicy>,
    #[serde(rename = "binding")]
    pub bindings: Vec<BindingSeed>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    #[serde(deserialize_with = "duration_str")]
    pub resync_interval: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub pass_timeout: Duration,
    pub workers: usize,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            pass_timeout: Duration::from_secs(10),
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    #[serde(deserialize_with = "duration_str")]
    pub interval: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Readiness path on the member cluster endpoint.
    pub path: String,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
            success_threshold: 1,
            path: "/readyz".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PurgeSection {
    pub max_attempts: u32,
    #[serde(deserialize_with = "duration_str")]
    pub initial_backoff: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub max_backoff: Duration,
    /// Wait before the pass after a failed purge; doubles per failure.
    #[serde(deserialize_with = "duration_str")]
    pub retry_after: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub max_retry_after: Duration,
}

impl Default for PurgeSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            retry_after: Duration::from_secs(10),
            max_retry_after: Duration::from_secs(300),
        }
    }
}

/// TTLs carried by the built-in taints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaintSection {
    pub not_ready_toleration_seconds: Option<u64>,
    pub unreachable_toleration_seconds: Option<u64>,
}

impl Default for TaintSection {
    fn default() -> Self {
        Self {
            not_ready_toleration_seconds: Some(300),
            unreachable_toleration_seconds: Some(300),
        }
    }
}

/// A member cluster registered at start-up.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterSeed {
    pub name: String,
    pub api_endpoint: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl ClusterSeed {
    pub fn to_record(&self) -> ClusterRecord {
        let mut record = ClusterRecord::new(&self.name, &self.api_endpoint);
        record.labels = self.labels.clone();
        record.taints = self.taints.clone();
        record
    }
}

/// An initial assignment of a workload.
#[derive(Debug, Clone, Deserialize)]
pub struct BindingSeed {
    pub workload: WorkloadRef,
    /// Policy key, `{namespace}/{name}`.
    pub policy: String,
    pub clusters: Vec<String>,
}

impl BindingSeed {
    pub fn to_binding(&self) -> Binding {
        Binding::new(self.workload.clone(), &self.policy, self.clusters.clone())
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.controller.workers == 0 {
            bail!("controller.workers must be at least 1");
        }
        if self.controller.pass_timeout.is_zero() {
            bail!("controller.pass_timeout must be positive");
        }
        if self.probe.interval.is_zero() {
            bail!("probe.interval must be positive");
        }
        for policy in &self.policies {
            let key = format!("{}/{}", policy.namespace, policy.name);
            for behavior in [
                policy.cluster_failover().map(|b| (b.purge_mode, b.grace_period_seconds)),
                policy.application_failover().map(|b| (b.purge_mode, b.grace_period_seconds)),
            ]
            .into_iter()
            .flatten()
            {
                if behavior == (PurgeMode::Graciously, None) {
                    tracing::warn!(
                        policy = %key,
                        "Graciously purge without grace_period_seconds, evicted workloads are purged on the next pass"
                    );
                }
            }
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            resync_interval: self.controller.resync_interval,
            pass_timeout: self.controller.pass_timeout,
            workers: self.controller.workers,
            purge_retry: self.retry_config(),
            purge_backoff: self.purge_backoff(),
            taints: self.taint_config(),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.purge.max_attempts.max(1),
            initial_delay: self.purge.initial_backoff,
            max_delay: self.purge.max_backoff,
            ..Default::default()
        }
    }

    /// Clock ticks are whole seconds, so sub-second values round up.
    pub fn purge_backoff(&self) -> PurgeBackoff {
        let secs = |d: Duration| d.as_secs() + u64::from(d.subsec_nanos() > 0);
        PurgeBackoff {
            initial_secs: secs(self.purge.retry_after).max(1),
            max_secs: secs(self.purge.max_retry_after).max(1),
        }
    }

    pub fn taint_config(&self) -> TaintConfig {
        TaintConfig {
            not_ready_ttl_seconds: self.taints.not_ready_toleration_seconds,
            unreachable_ttl_seconds: self.taints.unreachable_toleration_seconds,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.probe.interval,
            failure_threshold: self.probe.failure_threshold,
            success_threshold: self.probe.success_threshold,
            write_timeout: self.controller.pass_timeout,
        }
    }

    pub fn cluster_probe(&self) -> HttpClusterProbe {
        HttpClusterProbe::new(&self.probe.path, self.probe.timeout)
    }
}

/// Parse a duration string like "500ms", "5s", "2m". A bare number is seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => bail!("unknown duration unit {other:?} in {s:?}"),
    }
}

fn duration_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}
