//! Domain types for the WarpFleet state store.
//!
//! These types represent the persisted state of member clusters, placement
//! policies, and bindings. All types are serializable to/from JSON for
//! storage in redb tables. Every record carries a `resource_version` used
//! for optimistic concurrency control.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique name of a member cluster.
pub type ClusterName = String;

/// Key of a binding (`{namespace}/{name}`).
pub type BindingId = String;

/// Key of a placement policy (`{namespace}/{name}`).
pub type PolicyId = String;

/// Taint key applied while a cluster's Ready condition is `False`.
pub const TAINT_NOT_READY: &str = "cluster.warpfleet.io/not-ready";

/// Taint key applied while a cluster's Ready condition is `Unknown`.
pub const TAINT_UNREACHABLE: &str = "cluster.warpfleet.io/unreachable";

/// Default window for application-level decisions (seconds).
pub const DEFAULT_APPLICATION_TOLERATION_SECONDS: u64 = 300;

/// A record stored with compare-and-swap semantics.
pub trait Versioned {
    /// Key of this record in its table.
    fn table_key(&self) -> String;
    /// Version the record was read at (0 = never stored).
    fn resource_version(&self) -> u64;
    /// Overwrite the version (the store does this on every write).
    fn set_resource_version(&mut self, version: u64);
}

// ── Cluster ───────────────────────────────────────────────────────

/// A member cluster registered with the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRecord {
    pub name: ClusterName,
    /// Endpoint the health prober talks to.
    pub api_endpoint: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Latest Ready condition. `None` until the first probe result lands.
    #[serde(default)]
    pub ready: Option<ClusterCondition>,
    #[serde(default)]
    pub resource_version: u64,
}

impl ClusterRecord {
    pub fn new(name: &str, api_endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            api_endpoint: api_endpoint.to_string(),
            labels: HashMap::new(),
            taints: Vec::new(),
            ready: None,
            resource_version: 0,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Find a taint by key and effect.
    pub fn find_taint(&self, key: &str, effect: TaintEffect) -> Option<&Taint> {
        self.taints
            .iter()
            .find(|t| t.key == key && t.effect == effect)
    }

    pub fn has_taint(&self, key: &str, effect: TaintEffect) -> bool {
        self.find_taint(key, effect).is_some()
    }

    /// Ready condition status, `Unknown` when never probed.
    pub fn ready_status(&self) -> ConditionStatus {
        self.ready
            .as_ref()
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }
}

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Observed cluster condition with the time it last flipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterCondition {
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    /// Unix timestamp of the last status change.
    pub last_transition: u64,
}

/// What a taint does to workloads placed on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    /// New placements are refused; existing ones stay.
    NoSchedule,
    /// Existing placements are evicted once their toleration runs out.
    NoExecute,
}

/// A fault marker on a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    pub effect: TaintEffect,
    /// Window applied when a policy carries no matching toleration.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    /// Unix timestamp of first detection. Never reset while the taint exists.
    #[serde(default)]
    pub time_added: Option<u64>,
}

impl Taint {
    pub fn new(key: &str, effect: TaintEffect) -> Self {
        Self {
            key: key.to_string(),
            value: None,
            effect,
            ttl_seconds: None,
            time_added: None,
        }
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    pub fn added_at(mut self, time: u64) -> Self {
        self.time_added = Some(time);
        self
    }

    /// Same key and effect (taint identity).
    pub fn same_as(&self, other: &Taint) -> bool {
        self.key == other.key && self.effect == other.effect
    }
}

// ── Placement policy ──────────────────────────────────────────────

/// Declares where selected workloads may run and how failures are handled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlacementPolicy {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub resource_selectors: Vec<ResourceSelector>,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub failover: Option<FailoverBehavior>,
    #[serde(default)]
    pub resource_version: u64,
}

impl PlacementPolicy {
    pub fn new(namespace: &str, name: &str, placement: Placement) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            resource_selectors: Vec::new(),
            placement,
            failover: None,
            resource_version: 0,
        }
    }

    /// Application failover behavior, if configured.
    pub fn application_failover(&self) -> Option<&ApplicationFailoverBehavior> {
        self.failover.as_ref().and_then(|f| f.application.as_ref())
    }

    /// Cluster failover behavior, if configured.
    pub fn cluster_failover(&self) -> Option<&ClusterFailoverBehavior> {
        self.failover.as_ref().and_then(|f| f.cluster.as_ref())
    }

    /// Whether any selector picks the given workload.
    pub fn selects(&self, workload: &WorkloadRef) -> bool {
        self.resource_selectors.iter().any(|s| s.matches(workload))
    }
}

/// Selects workloads by type and optional namespace/name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSelector {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ResourceSelector {
    pub fn matches(&self, workload: &WorkloadRef) -> bool {
        self.api_version == workload.api_version
            && self.kind == workload.kind
            && self.namespace.as_ref().is_none_or(|ns| *ns == workload.namespace)
            && self.name.as_ref().is_none_or(|n| *n == workload.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Placement {
    #[serde(default)]
    pub cluster_affinity: Option<ClusterAffinity>,
    #[serde(default)]
    pub cluster_tolerations: Vec<Toleration>,
    #[serde(default)]
    pub spread_constraints: Vec<SpreadConstraint>,
    /// Soft preference used to rank eligible clusters.
    #[serde(default)]
    pub preferred_labels: HashMap<String, String>,
}

/// Hard cluster filter. Empty lists/selectors match everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClusterAffinity {
    #[serde(default)]
    pub cluster_names: Vec<ClusterName>,
    #[serde(default)]
    pub exclude: Vec<ClusterName>,
    #[serde(default)]
    pub label_selector: HashMap<String, String>,
}

impl ClusterAffinity {
    pub fn matches(&self, cluster: &ClusterRecord) -> bool {
        if !self.cluster_names.is_empty() && !self.cluster_names.contains(&cluster.name) {
            return false;
        }
        if self.exclude.contains(&cluster.name) {
            return false;
        }
        self.label_selector
            .iter()
            .all(|(k, v)| cluster.labels.get(k).is_some_and(|cv| cv == v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

/// Willingness to run on a tainted cluster, optionally for a bounded time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Toleration {
    /// `None` together with `Exists` matches every key.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: Option<String>,
    /// `None` matches every effect.
    #[serde(default)]
    pub effect: Option<TaintEffect>,
    /// `None` tolerates forever. Only meaningful for `NoExecute`.
    #[serde(default)]
    pub toleration_seconds: Option<u64>,
}

impl Toleration {
    /// Tolerate `key` with `NoExecute` for `seconds`.
    pub fn for_key(key: &str, seconds: u64) -> Self {
        Self {
            key: Some(key.to_string()),
            operator: TolerationOperator::Exists,
            value: None,
            effect: Some(TaintEffect::NoExecute),
            toleration_seconds: Some(seconds),
        }
    }

    pub fn not_ready(seconds: u64) -> Self {
        Self::for_key(TAINT_NOT_READY, seconds)
    }

    pub fn unreachable(seconds: u64) -> Self {
        Self::for_key(TAINT_UNREACHABLE, seconds)
    }

    pub fn tolerates(&self, taint: &Taint) -> bool {
        if self.effect.is_some_and(|e| e != taint.effect) {
            return false;
        }
        match (&self.key, self.operator) {
            (None, TolerationOperator::Exists) => true,
            (None, TolerationOperator::Equal) => false,
            (Some(key), _) if *key != taint.key => false,
            (Some(_), TolerationOperator::Exists) => true,
            (Some(_), TolerationOperator::Equal) => self.value == taint.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpreadByField {
    #[default]
    Cluster,
}

/// Bounds on how many clusters host the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpreadConstraint {
    #[serde(default)]
    pub spread_by_field: SpreadByField,
    #[serde(default)]
    pub min_groups: usize,
    #[serde(default)]
    pub max_groups: usize,
}

impl SpreadConstraint {
    pub fn by_cluster(min_groups: usize, max_groups: usize) -> Self {
        Self {
            spread_by_field: SpreadByField::Cluster,
            min_groups,
            max_groups,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FailoverBehavior {
    #[serde(default)]
    pub cluster: Option<ClusterFailoverBehavior>,
    #[serde(default)]
    pub application: Option<ApplicationFailoverBehavior>,
}

/// How a cluster evicted because of its taints gets cleaned up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClusterFailoverBehavior {
    #[serde(default)]
    pub purge_mode: PurgeMode,
    #[serde(default)]
    pub grace_period_seconds: Option<u64>,
}

/// Application-level failover: evict after the workload stays unhealthy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ApplicationFailoverBehavior {
    #[serde(default)]
    pub decision_conditions: DecisionConditions,
    #[serde(default)]
    pub purge_mode: PurgeMode,
    /// Required for `Graciously`; ignored otherwise.
    #[serde(default)]
    pub grace_period_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionConditions {
    #[serde(default = "default_application_toleration")]
    pub toleration_seconds: u64,
}

impl Default for DecisionConditions {
    fn default() -> Self {
        Self {
            toleration_seconds: DEFAULT_APPLICATION_TOLERATION_SECONDS,
        }
    }
}

fn default_application_toleration() -> u64 {
    DEFAULT_APPLICATION_TOLERATION_SECONDS
}

/// Fate of the workload on a cluster it was evicted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PurgeMode {
    #[default]
    Immediately,
    Graciously,
    Never,
}

// ── Binding ───────────────────────────────────────────────────────

/// Reference to the workload object propagated to member clusters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkloadRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// The placement assignment of one workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Binding {
    pub namespace: String,
    pub name: String,
    pub workload: WorkloadRef,
    /// Key of the governing placement policy.
    pub policy: PolicyId,
    /// Ordered target clusters.
    #[serde(default)]
    pub clusters: Vec<ClusterName>,
    /// Per-cluster workload health as last observed.
    #[serde(default)]
    pub health: Vec<WorkloadHealthStatus>,
    /// Clusters dropped from `clusters` whose footprint is not purged yet.
    #[serde(default)]
    pub eviction_tasks: Vec<EvictionTask>,
    #[serde(default)]
    pub conditions: Vec<BindingCondition>,
    /// Unix timestamp of the last committed rescheduling decision.
    #[serde(default)]
    pub last_decision_at: Option<u64>,
    #[serde(default)]
    pub resource_version: u64,
}

impl Binding {
    pub fn new(workload: WorkloadRef, policy: &str, clusters: Vec<ClusterName>) -> Self {
        Self {
            namespace: workload.namespace.clone(),
            name: format!("{}-{}", workload.name, workload.kind.to_lowercase()),
            workload,
            policy: policy.to_string(),
            clusters,
            health: Vec::new(),
            eviction_tasks: Vec::new(),
            conditions: Vec::new(),
            last_decision_at: None,
            resource_version: 0,
        }
    }

    pub fn health_for(&self, cluster: &str) -> Option<&WorkloadHealthStatus> {
        self.health.iter().find(|h| h.cluster == cluster)
    }

    pub fn eviction_task_for(&self, cluster: &str) -> Option<&EvictionTask> {
        self.eviction_tasks.iter().find(|t| t.from_cluster == cluster)
    }

    pub fn condition(&self, kind: BindingConditionKind) -> Option<&BindingCondition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Upsert a condition. `last_transition` only moves when the status
    /// flips. Returns true if anything changed.
    pub fn set_condition(
        &mut self,
        kind: BindingConditionKind,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: u64,
    ) -> bool {
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                true
            }
            None => {
                self.conditions.push(BindingCondition {
                    kind,
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition: now,
                });
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Workload health on one target cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadHealthStatus {
    pub cluster: ClusterName,
    pub health: WorkloadHealth,
    /// First time the workload was seen unhealthy in the current streak.
    #[serde(default)]
    pub unhealthy_since: Option<u64>,
    /// Unix timestamp of the last health change.
    pub last_transition: u64,
}

/// Why a cluster was dropped from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    /// A `NoExecute` taint outlived its toleration.
    TaintUntolerated,
    /// The workload stayed unhealthy past its decision window.
    ApplicationFailure,
    /// The cluster record no longer exists.
    ClusterNotFound,
    /// The resolver chose a different set without a fault.
    Rescheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurgeState {
    /// Waiting for the purge executor.
    PendingPurge,
    /// `PurgeMode::Never`: the footprint stays.
    Retained,
}

/// Pending cleanup on a cluster that left the assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvictionTask {
    pub from_cluster: ClusterName,
    pub reason: EvictionReason,
    #[serde(default)]
    pub message: String,
    pub purge_mode: PurgeMode,
    #[serde(default)]
    pub grace_period_seconds: Option<u64>,
    /// Decision time.
    pub created_at: u64,
    pub state: PurgeState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time a failed delete may be tried again.
    #[serde(default)]
    pub next_attempt_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingConditionKind {
    Scheduled,
    Degraded,
    PurgeFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingCondition {
    pub kind: BindingConditionKind,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition: u64,
}

// ── Keys ──────────────────────────────────────────────────────────

impl Versioned for ClusterRecord {
    fn table_key(&self) -> String {
        self.name.clone()
    }
    fn resource_version(&self) -> u64 {
        self.resource_version
    }
    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }
}

impl Versioned for PlacementPolicy {
    fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
    fn resource_version(&self) -> u64 {
        self.resource_version
    }
    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }
}

impl Versioned for Binding {
    fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
    fn resource_version(&self) -> u64 {
        self.resource_version
    }
    fn set_resource_version(&mut self, version: u64) {
        self.resource_version = version;
    }
}
