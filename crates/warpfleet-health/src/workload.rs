//! Per-cluster workload health.
//!
//! Observations from member clusters are folded into the binding's
//! `health` list. The unhealthy-since timestamp is stored explicitly so
//! the application-level toleration window can be re-evaluated from
//! persisted state alone.

use async_trait::async_trait;

use warpfleet_state::{Binding, WorkloadHealth, WorkloadHealthStatus, WorkloadRef};

/// One readiness reading of a workload on a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadObservation {
    pub ready: bool,
    /// When the reported readiness began, as seen by the member cluster.
    pub since: u64,
}

/// Reads workload readiness from a member cluster.
#[async_trait]
pub trait WorkloadProbe: Send + Sync {
    async fn probe(&self, workload: &WorkloadRef, cluster: &str) -> anyhow::Result<WorkloadObservation>;
}

/// Fold an observation into `binding`. Returns true if the binding changed.
///
/// Entries for clusters that are no longer targets are pruned. An
/// unhealthy streak keeps its original start time; a healthy reading
/// clears it.
pub fn record_observation(
    binding: &mut Binding,
    cluster: &str,
    observation: WorkloadObservation,
    now: u64,
) -> bool {
    let before = binding.health.len();
    let targets = binding.clusters.clone();
    binding.health.retain(|h| targets.contains(&h.cluster));
    let mut changed = binding.health.len() != before;

    if !binding.clusters.iter().any(|c| c == cluster) {
        return changed;
    }

    let health = if observation.ready {
        WorkloadHealth::Healthy
    } else {
        WorkloadHealth::Unhealthy
    };
    // Never date the streak into the future when clocks disagree.
    let since = observation.since.min(now);

    match binding.health.iter_mut().find(|h| h.cluster == cluster) {
        Some(entry) if entry.health == health => {}
        Some(entry) => {
            entry.health = health;
            entry.last_transition = now;
            entry.unhealthy_since = match health {
                WorkloadHealth::Unhealthy => Some(since),
                _ => None,
            };
            changed = true;
        }
        None => {
            binding.health.push(WorkloadHealthStatus {
                cluster: cluster.to_string(),
                health,
                unhealthy_since: (health == WorkloadHealth::Unhealthy).then_some(since),
                last_transition: now,
            });
            changed = true;
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding() -> Binding {
        Binding::new(
            WorkloadRef::new("apps/v1", "Deployment", "default", "nginx"),
            "default/nginx",
            vec!["member1".to_string(), "member2".to_string()],
        )
    }

    fn unhealthy(since: u64) -> WorkloadObservation {
        WorkloadObservation { ready: false, since }
    }

    fn healthy(since: u64) -> WorkloadObservation {
        WorkloadObservation { ready: true, since }
    }

    #[test]
    fn first_observation_creates_entry() {
        let mut binding = binding();
        assert!(record_observation(&mut binding, "member1", unhealthy(90), 100));

        let entry = binding.health_for("member1").unwrap();
        assert_eq!(entry.health, WorkloadHealth::Unhealthy);
        assert_eq!(entry.unhealthy_since, Some(90));
        assert_eq!(entry.last_transition, 100);
    }

    #[test]
    fn unhealthy_streak_keeps_start_time() {
        let mut binding = binding();
        record_observation(&mut binding, "member1", unhealthy(90), 100);
        assert!(!record_observation(&mut binding, "member1", unhealthy(150), 160));

        assert_eq!(binding.health_for("member1").unwrap().unhealthy_since, Some(90));
    }

    #[test]
    fn healthy_reading_clears_streak() {
        let mut binding = binding();
        record_observation(&mut binding, "member1", unhealthy(90), 100);
        assert!(record_observation(&mut binding, "member1", healthy(120), 120));

        let entry = binding.health_for("member1").unwrap();
        assert_eq!(entry.health, WorkloadHealth::Healthy);
        assert_eq!(entry.unhealthy_since, None);

        record_observation(&mut binding, "member1", unhealthy(200), 200);
        assert_eq!(binding.health_for("member1").unwrap().unhealthy_since, Some(200));
    }

    #[test]
    fn future_since_is_clamped_to_now() {
        let mut binding = binding();
        record_observation(&mut binding, "member1", unhealthy(500), 100);
        assert_eq!(binding.health_for("member1").unwrap().unhealthy_since, Some(100));
    }

    #[test]
    fn observation_for_non_target_is_ignored() {
        let mut binding = binding();
        assert!(!record_observation(&mut binding, "member3", unhealthy(1), 1));
        assert!(binding.health.is_empty());
    }

    #[test]
    fn stale_entries_are_pruned() {
        let mut binding = binding();
        record_observation(&mut binding, "member2", unhealthy(1), 1);
        binding.clusters = vec!["member1".to_string()];

        assert!(record_observation(&mut binding, "member1", healthy(5), 5));
        assert!(binding.health_for("member2").is_none());
        assert_eq!(binding.health.len(), 1);
    }
}
