//! Rescheduler adapter.
//!
//! Builds the eligible cluster set for a binding, hands it to the
//! placement resolver, and checks the returned assignment against the
//! policy's spread bounds. An assignment that cannot satisfy the bounds
//! defers the decision: the binding keeps its clusters and reports
//! `Degraded` until a later pass succeeds.

use std::collections::HashMap;

use tracing::{info, warn};

use warpfleet_placement::{
    Infeasible, PlacementRequest, PlacementResolver, SpreadBounds, cluster_to_candidate, spread_bounds,
};
use warpfleet_state::{
    Binding, BindingConditionKind, ClusterName, ClusterRecord, ConditionStatus, EvictionReason, PlacementPolicy,
};

use crate::decision::FailoverDecision;
use crate::purge::eviction_task;
use crate::toleration::accepts_new_placement;

/// Result of asking the resolver for a new assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescheduleOutcome {
    /// Nothing was evicted; the assignment stands.
    Unchanged,
    Assigned(Vec<ClusterName>),
    /// No acceptable assignment exists right now.
    Deferred(String),
}

/// Clusters the workload may be placed on after `decision`.
///
/// A cluster qualifies if it matches the policy's affinity, is not being
/// evicted, is not the source of a fault eviction still tracked on the
/// binding, and either is already kept or tolerates its `NoSchedule`
/// taints.
pub fn eligible_clusters<'a>(
    binding: &Binding,
    clusters: &'a [ClusterRecord],
    policy: &PlacementPolicy,
    decision: &FailoverDecision,
) -> Vec<&'a ClusterRecord> {
    let tolerations = &policy.placement.cluster_tolerations;
    clusters
        .iter()
        .filter(|c| {
            policy
                .placement
                .cluster_affinity
                .as_ref()
                .is_none_or(|affinity| affinity.matches(c))
        })
        .filter(|c| !decision.is_evicted(&c.name))
        .filter(|c| {
            binding
                .eviction_task_for(&c.name)
                .is_none_or(|t| t.reason == EvictionReason::Rescheduled)
        })
        .filter(|c| decision.keep.contains(&c.name) || accepts_new_placement(c, tolerations))
        .collect()
}

/// Whether `assignment` is acceptable: non-empty, drawn from `eligible`
/// and inside the spread bounds.
pub fn verify_assignment(
    assignment: &[ClusterName],
    eligible: &[&ClusterRecord],
    bounds: Option<&SpreadBounds>,
) -> Result<(), String> {
    if assignment.is_empty() {
        return Err("resolver returned an empty assignment".to_string());
    }
    if let Some(unknown) = assignment.iter().find(|c| !eligible.iter().any(|e| e.name == **c)) {
        return Err(format!("resolver selected ineligible cluster {unknown}"));
    }
    for (i, cluster) in assignment.iter().enumerate() {
        if assignment[..i].contains(cluster) {
            return Err(format!("resolver selected cluster {cluster} twice"));
        }
    }
    if let Some(bounds) = bounds
        && !bounds.admits(assignment.len())
    {
        return Err(format!(
            "assignment of {} clusters violates spread bounds (min {}, max {:?})",
            assignment.len(),
            bounds.min_groups,
            bounds.max_groups
        ));
    }
    Ok(())
}

/// Ask `resolver` for a new assignment if `decision` evicts anything.
///
/// `workload_counts` feeds the resolver's balance scoring.
pub async fn reschedule(
    binding: &Binding,
    clusters: &[ClusterRecord],
    policy: &PlacementPolicy,
    decision: &FailoverDecision,
    resolver: &dyn PlacementResolver,
    workload_counts: &HashMap<ClusterName, u32>,
) -> RescheduleOutcome {
    if !decision.needs_reschedule() {
        return RescheduleOutcome::Unchanged;
    }

    let eligible = eligible_clusters(binding, clusters, policy, decision);
    let bounds = spread_bounds(&policy.placement.spread_constraints);
    let request = PlacementRequest {
        eligible: eligible
            .iter()
            .map(|c| cluster_to_candidate(c, workload_counts.get(&c.name).copied().unwrap_or(0)))
            .collect(),
        bounds,
        current: binding.clusters.clone(),
        preferred_labels: policy.placement.preferred_labels.clone(),
    };

    let assignment = match resolver.resolve(&request).await {
        Ok(assignment) => assignment,
        Err(Infeasible { eligible, min_groups }) => {
            return RescheduleOutcome::Deferred(format!(
                "{eligible} eligible clusters, at least {min_groups} required"
            ));
        }
    };

    match verify_assignment(&assignment, &eligible, bounds.as_ref()) {
        Ok(()) => RescheduleOutcome::Assigned(assignment),
        Err(message) => RescheduleOutcome::Deferred(message),
    }
}

/// Commit `assignment` to `binding` at decision time `now`.
///
/// Every dropped cluster gets an eviction task (unless one already
/// exists or the cluster is gone), tasks for re-selected clusters are
/// dropped and health entries of dropped clusters are pruned. Returns
/// true if the binding changed.
pub fn apply_assignment(
    binding: &mut Binding,
    assignment: Vec<ClusterName>,
    decision: &FailoverDecision,
    policy: &PlacementPolicy,
    now: u64,
) -> bool {
    let recovered = clear_degraded(binding, now);
    if assignment == binding.clusters {
        return recovered;
    }

    let old = std::mem::take(&mut binding.clusters);
    for cluster in old.iter().filter(|c| !assignment.contains(c)) {
        if binding.eviction_task_for(cluster).is_some() {
            continue;
        }
        let (reason, message) = match decision.reason_for(cluster) {
            Some(breach) => (breach.reason, breach.message.clone()),
            None => (EvictionReason::Rescheduled, "dropped by rescheduling".to_string()),
        };
        if reason == EvictionReason::ClusterNotFound {
            continue;
        }
        binding
            .eviction_tasks
            .push(eviction_task(cluster, reason, &message, policy, now));
    }

    binding.eviction_tasks.retain(|t| !assignment.contains(&t.from_cluster));
    binding.health.retain(|h| assignment.contains(&h.cluster));

    let id = format!("{}/{}", binding.namespace, binding.name);
    info!(
        binding = %id,
        from = ?old,
        to = ?assignment,
        "binding rescheduled"
    );

    let message = format!("assigned to {}", assignment.join(", "));
    binding.clusters = assignment;
    binding.last_decision_at = Some(now);
    binding.set_condition(
        BindingConditionKind::Scheduled,
        ConditionStatus::True,
        "Rescheduled",
        &message,
        now,
    );
    true
}

/// Record a deferred decision. The assignment is left untouched.
pub fn mark_degraded(binding: &mut Binding, message: &str, now: u64) -> bool {
    let changed = binding.set_condition(
        BindingConditionKind::Degraded,
        ConditionStatus::True,
        "InsufficientClusters",
        message,
        now,
    );
    if changed {
        let id = format!("{}/{}", binding.namespace, binding.name);
        warn!(binding = %id, %message, "rescheduling deferred");
    }
    changed
}

/// Lower a raised `Degraded` condition. Returns true if it changed.
pub fn clear_degraded(binding: &mut Binding, now: u64) -> bool {
    let raised = binding
        .condition(BindingConditionKind::Degraded)
        .is_some_and(|c| c.status == ConditionStatus::True);
    raised && binding.set_condition(BindingConditionKind::Degraded, ConditionStatus::False, "Recovered", "", now)
}
