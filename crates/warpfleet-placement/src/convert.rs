//! Type conversions between state store types and placement types.

use warpfleet_state::{ClusterRecord, SpreadByField, SpreadConstraint};

use crate::placer::SpreadBounds;
use crate::scorer::ClusterCandidate;

/// Convert a [`ClusterRecord`] to a [`ClusterCandidate`].
///
/// `workload_count` is passed externally because it is derived from the
/// binding table, not the cluster record.
pub fn cluster_to_candidate(cluster: &ClusterRecord, workload_count: u32) -> ClusterCandidate {
    ClusterCandidate {
        name: cluster.name.clone(),
        labels: cluster.labels.clone(),
        workload_count,
    }
}

/// Extract cluster-level spread bounds. A `max_groups` of 0 means unbounded.
pub fn spread_bounds(constraints: &[SpreadConstraint]) -> Option<SpreadBounds> {
    constraints
        .iter()
        .find(|c| c.spread_by_field == SpreadByField::Cluster)
        .map(|c| SpreadBounds {
            min_groups: c.min_groups,
            max_groups: (c.max_groups > 0).then_some(c.max_groups),
        })
}
