//! Toleration evaluation.
//!
//! Pure functions of state and time. Two independent windows exist: the
//! cluster-level one (policy tolerations against `NoExecute` taints) and
//! the application-level one (decision conditions against the workload's
//! unhealthy-since timestamp). A window is breached once the elapsed time
//! reaches it; exactly at the boundary counts as breached.

use warpfleet_state::{
    ApplicationFailoverBehavior, ClusterRecord, EvictionReason, Taint, TaintEffect, Toleration,
    WorkloadHealth, WorkloadHealthStatus,
};

/// Seconds between `since` and `now`. Clock skew never makes it negative.
pub fn elapsed_unhealthy(since: u64, now: u64) -> u64 {
    now.saturating_sub(since)
}

/// True while `duration` is still inside the window.
pub fn should_tolerate(duration: u64, toleration_seconds: u64) -> bool {
    duration < toleration_seconds
}

/// A window that ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breach {
    pub reason: EvictionReason,
    pub message: String,
}

/// Outcome of evaluating one window kind for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    pub breach: Option<Breach>,
    /// Earliest time a still-running window expires.
    pub next_check: Option<u64>,
}

impl Verdict {
    pub fn is_breached(&self) -> bool {
        self.breach.is_some()
    }
}

fn earliest(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Window granted by `tolerations` for `taint`: `None` means forever.
///
/// Among matching tolerations the shortest bound wins, unless one of them
/// is unbounded. Without a match the taint's own TTL applies, and without
/// a TTL the window is zero.
fn window_for(taint: &Taint, tolerations: &[Toleration]) -> Option<u64> {
    let mut matched = tolerations.iter().filter(|t| t.tolerates(taint)).peekable();
    if matched.peek().is_none() {
        return Some(taint.ttl_seconds.unwrap_or(0));
    }

    let mut window: Option<u64> = None;
    for toleration in matched {
        match toleration.toleration_seconds {
            None => return None,
            Some(secs) => window = Some(window.map_or(secs, |w| w.min(secs))),
        }
    }
    window
}

/// Cluster-level window: does any `NoExecute` taint on `cluster` outlast
/// the policy's tolerations?
///
/// A taint that was never stamped is treated as added at `now`.
pub fn evaluate_cluster(cluster: &ClusterRecord, tolerations: &[Toleration], now: u64) -> Verdict {
    let mut verdict = Verdict::default();

    for taint in cluster.taints.iter().filter(|t| t.effect == TaintEffect::NoExecute) {
        let Some(window) = window_for(taint, tolerations) else {
            continue;
        };
        let since = taint.time_added.unwrap_or(now);
        let elapsed = elapsed_unhealthy(since, now);

        if !should_tolerate(elapsed, window) {
            verdict.breach.get_or_insert_with(|| Breach {
                reason: EvictionReason::TaintUntolerated,
                message: format!(
                    "taint {}:NoExecute on cluster {} not tolerated after {elapsed}s (window {window}s)",
                    taint.key, cluster.name
                ),
            });
        } else {
            verdict.next_check = earliest(verdict.next_check, Some(since + window));
        }
    }

    verdict
}

/// Application-level window on one cluster.
pub fn evaluate_application(
    status: Option<&WorkloadHealthStatus>,
    behavior: &ApplicationFailoverBehavior,
    now: u64,
) -> Verdict {
    let Some(status) = status else {
        return Verdict::default();
    };
    if status.health != WorkloadHealth::Unhealthy {
        return Verdict::default();
    }

    let window = behavior.decision_conditions.toleration_seconds;
    let since = status.unhealthy_since.unwrap_or(status.last_transition);
    let elapsed = elapsed_unhealthy(since, now);

    if should_tolerate(elapsed, window) {
        Verdict {
            breach: None,
            next_check: Some(since + window),
        }
    } else {
        Verdict {
            breach: Some(Breach {
                reason: EvictionReason::ApplicationFailure,
                message: format!(
                    "workload unhealthy on cluster {} for {elapsed}s (window {window}s)",
                    status.cluster
                ),
            }),
            next_check: None,
        }
    }
}

/// Whether `cluster` may receive new placements: every `NoSchedule` taint
/// must be tolerated.
pub fn accepts_new_placement(cluster: &ClusterRecord, tolerations: &[Toleration]) -> bool {
    cluster
        .taints
        .iter()
        .filter(|t| t.effect == TaintEffect::NoSchedule)
        .all(|taint| tolerations.iter().any(|t| t.tolerates(taint)))
}

/// Merge two verdicts: either breach wins, the next check is the earliest.
pub fn race(cluster: Verdict, application: Verdict) -> Verdict {
    if cluster.is_breached() {
        return Verdict {
            breach: cluster.breach,
            next_check: None,
        };
    }
    if application.is_breached() {
        return Verdict {
            breach: application.breach,
            next_check: None,
        };
    }
    Verdict {
        breach: None,
        next_check: earliest(cluster.next_check, application.next_check),
    }
}
