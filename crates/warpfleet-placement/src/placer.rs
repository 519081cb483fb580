//! Placement engine: picks the target cluster set for one binding.
//!
//! The placer keeps clusters that are already assigned and still
//! eligible, then fills up from the score ranking until the target
//! group count is reached.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

use warpfleet_state::ClusterName;

use crate::scorer::{ClusterCandidate, ScoringWeights, rank_clusters};

/// Bounds on the number of clusters hosting a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpreadBounds {
    pub min_groups: usize,
    /// `None` = unbounded.
    pub max_groups: Option<usize>,
}

impl SpreadBounds {
    pub fn new(min_groups: usize, max_groups: Option<usize>) -> Self {
        Self {
            min_groups,
            max_groups,
        }
    }

    /// Whether an assignment of `count` clusters satisfies the bounds.
    pub fn admits(&self, count: usize) -> bool {
        count >= self.min_groups && self.max_groups.is_none_or(|max| count <= max)
    }
}

/// Input to a placement resolution.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    /// Clusters the workload may run on (affinity matched, not evicted).
    pub eligible: Vec<ClusterCandidate>,
    /// `None` when the policy carries no cluster spread constraint.
    pub bounds: Option<SpreadBounds>,
    /// The binding's current assignment, evicted clusters included.
    pub current: Vec<ClusterName>,
    pub preferred_labels: HashMap<String, String>,
}

/// Not enough eligible clusters to satisfy MinGroups.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("infeasible placement: {eligible} eligible clusters, at least {min_groups} required")]
pub struct Infeasible {
    pub eligible: usize,
    pub min_groups: usize,
}

/// The rescheduling collaborator. Returns the new ordered cluster set.
#[async_trait]
pub trait PlacementResolver: Send + Sync {
    async fn resolve(&self, request: &PlacementRequest) -> Result<Vec<ClusterName>, Infeasible>;
}

/// Default resolver backed by [`compute_assignment`].
#[derive(Debug, Clone, Default)]
pub struct ScoringResolver {
    pub weights: ScoringWeights,
}

impl ScoringResolver {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }
}

#[async_trait]
impl PlacementResolver for ScoringResolver {
    async fn resolve(&self, request: &PlacementRequest) -> Result<Vec<ClusterName>, Infeasible> {
        compute_assignment(request, &self.weights)
    }
}

/// Number of clusters to target: the current count clamped into the
/// bounds (at least one when nothing is assigned yet).
fn target_count(bounds: &SpreadBounds, current: usize) -> usize {
    let mut target = current.max(bounds.min_groups).max(1);
    if let Some(max) = bounds.max_groups {
        target = target.min(max.max(bounds.min_groups));
    }
    target
}

/// Compute the new assignment for `request`.
pub fn compute_assignment(
    request: &PlacementRequest,
    weights: &ScoringWeights,
) -> Result<Vec<ClusterName>, Infeasible> {
    let eligible = request.eligible.len();

    let target = match &request.bounds {
        Some(bounds) => {
            if eligible < bounds.min_groups {
                warn!(
                    eligible,
                    min_groups = bounds.min_groups,
                    "not enough eligible clusters"
                );
                return Err(Infeasible {
                    eligible,
                    min_groups: bounds.min_groups,
                });
            }
            target_count(bounds, request.current.len()).min(eligible)
        }
        None => eligible,
    };

    // Still-eligible clusters of the current assignment, in their order.
    let mut assignment: Vec<ClusterName> = request
        .current
        .iter()
        .filter(|c| request.eligible.iter().any(|e| e.name == **c))
        .take(target)
        .cloned()
        .collect();

    for scored in rank_clusters(&request.eligible, &request.preferred_labels, weights) {
        if assignment.len() >= target {
            break;
        }
        if assignment.contains(&scored.name) {
            continue;
        }
        debug!(cluster = %scored.name, score = scored.score, "selected cluster");
        assignment.push(scored.name);
    }

    Ok(assignment)
}
