//! warpfleet-health: health signals for WarpFleet.
//!
//! Holds the "latest observed health" half of the failover pipeline:
//!
//! - cluster reachability/readiness, probed over HTTP and debounced into a
//!   persisted Ready condition on the cluster record;
//! - per-cluster workload health, recorded on the binding with the time
//!   the current unhealthy streak started.
//!
//! # Architecture
//!
//! ```text
//! ClusterHealthMonitor
//!   ├── Per-cluster background task
//!   │   ├── HealthTracker (consecutive failures, backoff)
//!   │   ├── ClusterProbe::probe() → ProbeResult
//!   │   └── CAS update of ClusterRecord.ready in StateStore
//!   └── stop / stop_all
//!
//! WorkloadProbe::probe() → WorkloadObservation
//!   └── record_observation() → Binding.health
//! ```
//!
//! Exponential backoff (interval → 60s) prevents hammering an unreachable
//! cluster. A single successful probe resets the backoff.

pub mod checker;
pub mod monitor;
pub mod workload;

pub use checker::{ClusterHealth, ClusterProbe, HealthTracker, HttpClusterProbe, ProbeResult, http_probe, http_request};
pub use monitor::{ClusterHealthMonitor, MonitorConfig, update_ready_condition};
pub use workload::{WorkloadObservation, WorkloadProbe, record_observation};
