//! Taint manager: turns a cluster's Ready condition into fault taints.
//!
//! Ready=False yields the not-ready taints, Ready=Unknown the unreachable
//! ones, Ready=True neither. Each built-in taint is kept with both the
//! `NoSchedule` and `NoExecute` effect. A taint that stays wanted keeps
//! its original `time_added`.

use tokio::time::Instant;
use tracing::{debug, info};

use warpfleet_state::{
    ClusterRecord, ConditionStatus, StateStore, TAINT_NOT_READY, TAINT_UNREACHABLE, Taint, TaintEffect,
};

use crate::error::FailoverResult;
use crate::retry::retry_on_conflict;

const BUILT_IN_KEYS: [&str; 2] = [TAINT_NOT_READY, TAINT_UNREACHABLE];
const EFFECTS: [TaintEffect; 2] = [TaintEffect::NoSchedule, TaintEffect::NoExecute];

/// TTLs carried by the built-in `NoExecute` taints.
#[derive(Debug, Clone)]
pub struct TaintConfig {
    pub not_ready_ttl_seconds: Option<u64>,
    pub unreachable_ttl_seconds: Option<u64>,
}

impl Default for TaintConfig {
    fn default() -> Self {
        Self {
            not_ready_ttl_seconds: Some(300),
            unreachable_ttl_seconds: Some(300),
        }
    }
}

/// Difference between a cluster's taints and the taints it should carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterTaintDelta {
    pub added: Vec<Taint>,
    pub removed: Vec<Taint>,
    /// Existing taints that got their missing `time_added` filled in.
    pub stamped: Vec<Taint>,
    /// The full taint set the cluster should end up with.
    pub taints: Vec<Taint>,
}

impl ClusterTaintDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.stamped.is_empty()
    }

    pub fn apply(&self, cluster: &mut ClusterRecord) {
        cluster.taints = self.taints.clone();
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaintManager {
    config: TaintConfig,
}

impl TaintManager {
    pub fn new(config: TaintConfig) -> Self {
        Self { config }
    }

    /// Built-in taint key wanted for a Ready status. A cluster that was
    /// never probed gets none.
    fn wanted_key(cluster: &ClusterRecord) -> Option<&'static str> {
        match cluster.ready.as_ref()?.status {
            ConditionStatus::True => None,
            ConditionStatus::False => Some(TAINT_NOT_READY),
            ConditionStatus::Unknown => Some(TAINT_UNREACHABLE),
        }
    }

    fn ttl_for(&self, key: &str) -> Option<u64> {
        if key == TAINT_NOT_READY {
            self.config.not_ready_ttl_seconds
        } else {
            self.config.unreachable_ttl_seconds
        }
    }

    /// Compute the taint set `cluster` should carry at `now`.
    pub fn evaluate(&self, cluster: &ClusterRecord, now: u64) -> ClusterTaintDelta {
        let wanted = Self::wanted_key(cluster);
        let mut delta = ClusterTaintDelta::default();

        for taint in &cluster.taints {
            let built_in = BUILT_IN_KEYS.contains(&taint.key.as_str());
            let duplicate = delta.taints.iter().any(|t| t.same_as(taint));

            if duplicate || (built_in && wanted != Some(taint.key.as_str())) {
                delta.removed.push(taint.clone());
                continue;
            }

            let mut kept = taint.clone();
            if kept.time_added.is_none() {
                kept.time_added = Some(now);
                delta.stamped.push(kept.clone());
            }
            delta.taints.push(kept);
        }

        if let Some(key) = wanted {
            for effect in EFFECTS {
                if delta.taints.iter().any(|t| t.key == key && t.effect == effect) {
                    continue;
                }
                let mut taint = Taint::new(key, effect).added_at(now);
                if effect == TaintEffect::NoExecute {
                    taint.ttl_seconds = self.ttl_for(key);
                }
                delta.added.push(taint.clone());
                delta.taints.push(taint);
            }
        }

        delta
    }

    /// Bring the stored cluster's taints in line with its condition.
    ///
    /// Performs at most one successful compare-and-swap; conflicts re-read
    /// and re-evaluate until `deadline`. Returns the resulting record, or
    /// `None` if the cluster no longer exists.
    pub async fn reconcile(
        &self,
        state: &StateStore,
        cluster: &str,
        now: u64,
        deadline: Instant,
    ) -> FailoverResult<Option<ClusterRecord>> {
        retry_on_conflict(deadline, "taint update", || async move {
            let Some(mut record) = state.get_cluster(cluster)? else {
                return Ok(None);
            };

            let delta = self.evaluate(&record, now);
            if delta.is_empty() {
                debug!(%cluster, "taints up to date");
                return Ok(Some(record));
            }

            delta.apply(&mut record);
            let updated = state.update_cluster(&record)?;

            info!(
                %cluster,
                added = ?delta.added.iter().map(|t| t.key.as_str()).collect::<Vec<_>>(),
                removed = ?delta.removed.iter().map(|t| t.key.as_str()).collect::<Vec<_>>(),
                stamped = delta.stamped.len(),
                "cluster taints updated"
            );
            Ok(Some(updated))
        })
        .await
    }
}
