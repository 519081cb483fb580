//! Failover decision engine.
//!
//! `decide` runs both toleration windows for every assigned cluster and
//! splits the assignment into clusters to evict and clusters to keep. It
//! has no side effects, so re-running it on unchanged inputs gives the
//! same decision.

use std::collections::{BTreeMap, HashMap};

use warpfleet_state::{Binding, ClusterName, ClusterRecord, EvictionReason, PlacementPolicy};

use crate::toleration::{Breach, Verdict, evaluate_application, evaluate_cluster, race};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverDecision {
    /// Assigned clusters whose window ran out, in assignment order.
    pub evict: Vec<ClusterName>,
    /// Assigned clusters that stay, in assignment order.
    pub keep: Vec<ClusterName>,
    pub reasons: BTreeMap<ClusterName, Breach>,
    /// Earliest future time a running window expires.
    pub next_check: Option<u64>,
}

impl FailoverDecision {
    pub fn needs_reschedule(&self) -> bool {
        !self.evict.is_empty()
    }

    pub fn is_evicted(&self, cluster: &str) -> bool {
        self.evict.iter().any(|c| c == cluster)
    }

    pub fn reason_for(&self, cluster: &str) -> Option<&Breach> {
        self.reasons.get(cluster)
    }
}

/// Decide which assigned clusters must be evicted at `now`.
///
/// Cluster-level and application-level windows race: either breach
/// evicts. A cluster record that no longer exists is evicted at once.
pub fn decide(
    binding: &Binding,
    clusters: &HashMap<ClusterName, ClusterRecord>,
    policy: &PlacementPolicy,
    now: u64,
) -> FailoverDecision {
    let mut decision = FailoverDecision::default();
    let tolerations = &policy.placement.cluster_tolerations;
    let application = policy.application_failover();

    for name in &binding.clusters {
        let verdict = match clusters.get(name) {
            None => Verdict {
                breach: Some(Breach {
                    reason: EvictionReason::ClusterNotFound,
                    message: format!("cluster {name} no longer exists"),
                }),
                next_check: None,
            },
            Some(cluster) => {
                let cluster_verdict = evaluate_cluster(cluster, tolerations, now);
                let app_verdict = application
                    .map(|behavior| evaluate_application(binding.health_for(name), behavior, now))
                    .unwrap_or_default();
                race(cluster_verdict, app_verdict)
            }
        };

        match verdict.breach {
            Some(breach) => {
                decision.evict.push(name.clone());
                decision.reasons.insert(name.clone(), breach);
            }
            None => {
                decision.keep.push(name.clone());
                if let Some(at) = verdict.next_check {
                    decision.next_check = Some(decision.next_check.map_or(at, |n| n.min(at)));
                }
            }
        }
    }

    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use warpfleet_state::{
        ApplicationFailoverBehavior, DecisionConditions, FailoverBehavior, Placement, SpreadConstraint,
        TAINT_UNREACHABLE, Taint, TaintEffect, Toleration, WorkloadHealth, WorkloadHealthStatus, WorkloadRef,
    };

    fn fleet(clusters: Vec<ClusterRecord>) -> HashMap<ClusterName, ClusterRecord> {
        clusters.into_iter().map(|c| (c.name.clone(), c)).collect()
    }

    fn cluster(name: &str) -> ClusterRecord {
        ClusterRecord::new(name, "https://10.0.0.1:6443")
    }

    fn unreachable_since(name: &str, since: u64) -> ClusterRecord {
        let mut c = cluster(name);
        c.taints = vec![
            Taint::new(TAINT_UNREACHABLE, TaintEffect::NoSchedule).added_at(since),
            Taint::new(TAINT_UNREACHABLE, TaintEffect::NoExecute).with_ttl(300).added_at(since),
        ];
        c
    }

    fn policy(app_toleration: Option<u64>) -> PlacementPolicy {
        let mut policy = PlacementPolicy::new(
            "default",
            "nginx",
            Placement {
                cluster_tolerations: vec![Toleration::unreachable(2), Toleration::not_ready(2)],
                spread_constraints: vec![SpreadConstraint::by_cluster(1, 1)],
                ..Default::default()
            },
        );
        policy.failover = app_toleration.map(|secs| FailoverBehavior {
            cluster: None,
            application: Some(ApplicationFailoverBehavior {
                decision_conditions: DecisionConditions { toleration_seconds: secs },
                ..Default::default()
            }),
        });
        policy
    }

    fn binding(clusters: &[&str]) -> Binding {
        Binding::new(
            WorkloadRef::new("apps/v1", "Deployment", "default", "nginx"),
            "default/nginx",
            clusters.iter().map(|c| c.to_string()).collect(),
        )
    }

    #[test]
    fn healthy_assignment_is_kept() {
        let decision = decide(
            &binding(&["member1"]),
            &fleet(vec![cluster("member1"), cluster("member2")]),
            &policy(None),
            100,
        );
        assert!(!decision.needs_reschedule());
        assert_eq!(decision.keep, vec!["member1".to_string()]);
        assert_eq!(decision.next_check, None);
    }

    #[test]
    fn unreachable_cluster_is_kept_inside_window() {
        let clusters = fleet(vec![unreachable_since("member1", 100), cluster("member2")]);
        let decision = decide(&binding(&["member1"]), &clusters, &policy(None), 101);

        assert!(!decision.needs_reschedule());
        assert_eq!(decision.next_check, Some(102));
    }

    #[test]
    fn unreachable_cluster_is_evicted_at_window() {
        let clusters = fleet(vec![unreachable_since("member1", 100), cluster("member2")]);
        let decision = decide(&binding(&["member1"]), &clusters, &policy(None), 102);

        assert_eq!(decision.evict, vec!["member1".to_string()]);
        assert_eq!(
            decision.reason_for("member1").unwrap().reason,
            EvictionReason::TaintUntolerated
        );
    }

    #[test]
    fn missing_cluster_is_evicted() {
        let decision = decide(&binding(&["member9"]), &fleet(vec![cluster("member1")]), &policy(None), 1);
        assert!(decision.is_evicted("member9"));
        assert_eq!(decision.reason_for("member9").unwrap().reason, EvictionReason::ClusterNotFound);
    }

    #[test]
    fn application_failure_evicts_healthy_cluster() {
        let mut binding = binding(&["member1", "member2"]);
        binding.health.push(WorkloadHealthStatus {
            cluster: "member1".to_string(),
            health: WorkloadHealth::Unhealthy,
            unhealthy_since: Some(100),
            last_transition: 100,
        });
        let clusters = fleet(vec![cluster("member1"), cluster("member2")]);

        let early = decide(&binding, &clusters, &policy(Some(30)), 129);
        assert!(!early.needs_reschedule());
        assert_eq!(early.next_check, Some(130));

        let late = decide(&binding, &clusters, &policy(Some(30)), 130);
        assert_eq!(late.evict, vec!["member1".to_string()]);
        assert_eq!(late.keep, vec!["member2".to_string()]);
        assert_eq!(late.reason_for("member1").unwrap().reason, EvictionReason::ApplicationFailure);
    }

    #[test]
    fn application_window_ignored_without_behavior() {
        let mut binding = binding(&["member1"]);
        binding.health.push(WorkloadHealthStatus {
            cluster: "member1".to_string(),
            health: WorkloadHealth::Unhealthy,
            unhealthy_since: Some(0),
            last_transition: 0,
        });
        let decision = decide(&binding, &fleet(vec![cluster("member1")]), &policy(None), 10_000);
        assert!(!decision.needs_reschedule());
    }

    #[test]
    fn decide_is_idempotent() {
        let clusters = fleet(vec![unreachable_since("member1", 100), cluster("member2")]);
        let binding = binding(&["member1", "member2"]);
        let policy = policy(Some(30));

        let first = decide(&binding, &clusters, &policy, 150);
        let second = decide(&binding, &clusters, &policy, 150);
        assert_eq!(first, second);
    }
}
