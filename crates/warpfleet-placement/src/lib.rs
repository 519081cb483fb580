//! WarpFleet placement resolver.
//!
//! Given the clusters that are still eligible for a workload and the
//! spread bounds of its policy, pick the new target cluster set. The
//! failover controller owns the trigger and checks the bounds on the
//! result; this crate owns the heuristic.
//!
//! # Components
//!
//! - **`scorer`**: cluster scoring (preferred labels, load balance)
//! - **`placer`**: selection under MinGroups/MaxGroups, the `PlacementResolver` seam
//! - **`convert`**: conversions from state store types

pub mod convert;
pub mod placer;
pub mod scorer;

pub use convert::{cluster_to_candidate, spread_bounds};
pub use placer::{Infeasible, PlacementRequest, PlacementResolver, ScoringResolver, SpreadBounds, compute_assignment};
pub use scorer::{ClusterCandidate, ClusterScore, ScoringWeights, rank_clusters, score_cluster};
