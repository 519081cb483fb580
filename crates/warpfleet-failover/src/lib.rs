//! WarpFleet failover: decides when a workload leaves a cluster and
//! cleans up behind it.
//!
//! # Pipeline
//!
//! ```text
//! Cluster Ready condition ──► TaintManager ──► NoSchedule / NoExecute taints
//!                                                 │
//! Binding.health (workload probe) ──────────┐     │
//!                                           ▼     ▼
//!                                   decide() ─ toleration windows race
//!                                           │
//!                      evict ──► reschedule() via PlacementResolver
//!                                           │   verified, or Degraded
//!                                           ▼
//!                              EvictionTask ──► PurgeExecutor ──► WorkloadDeleter
//! ```
//!
//! `FailoverController` drives the pipeline from store events, a periodic
//! resync and timed requeues at window expiry. Each binding pass commits
//! through compare-and-swap, so concurrent or repeated passes converge.

pub mod controller;
pub mod decision;
pub mod error;
pub mod purge;
pub mod queue;
pub mod reschedule;
pub mod retry;
pub mod taint;
pub mod toleration;

pub use controller::{BindingOutcome, ControllerConfig, FailoverController};
pub use decision::{FailoverDecision, decide};
pub use error::{FailoverError, FailoverResult};
pub use purge::{PurgeAction, PurgeBackoff, PurgeExecutor, PurgeReport, WorkloadDeleter, eviction_task, purge, purge_action};
pub use queue::{ReconcileKey, WorkQueue};
pub use reschedule::{RescheduleOutcome, apply_assignment, eligible_clusters, reschedule, verify_assignment};
pub use retry::{RetryConfig, retry_on_conflict, retry_with_backoff};
pub use taint::{ClusterTaintDelta, TaintConfig, TaintManager};
pub use toleration::{Breach, Verdict, accepts_new_placement, elapsed_unhealthy, should_tolerate};
