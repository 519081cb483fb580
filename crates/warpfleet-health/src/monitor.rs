//! Cluster health monitor: background tasks that probe member clusters.
//!
//! The `ClusterHealthMonitor` spawns a background task per cluster that
//! periodically probes the cluster and persists the debounced Ready
//! condition on the cluster record. The taint manager reacts to that
//! condition; the monitor never touches taints itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use warpfleet_state::*;

use crate::checker::{ClusterProbe, HealthTracker};

/// Probe cadence and debouncing thresholds.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Upper bound on conflict retries when writing the condition.
    pub write_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            failure_threshold: 3,
            success_threshold: 1,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// A running probe loop and the switch that ends it.
struct ProbeLoop {
    task: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl ProbeLoop {
    fn halt(self) {
        let _ = self.stop.send(true);
        self.task.abort();
    }
}

/// Manages health probe loops for all registered clusters.
pub struct ClusterHealthMonitor {
    state: StateStore,
    probe: Arc<dyn ClusterProbe>,
    clock: SharedClock,
    config: MonitorConfig,
    loops: Arc<RwLock<HashMap<String, ProbeLoop>>>,
}

impl ClusterHealthMonitor {
    pub fn new(
        state: StateStore,
        probe: Arc<dyn ClusterProbe>,
        clock: SharedClock,
        config: MonitorConfig,
    ) -> Self {
        Self {
            state,
            probe,
            clock,
            config,
            loops: Arc::default(),
        }
    }

    /// Start probing a cluster, replacing any loop already running for it.
    pub async fn start_monitor(&self, cluster: &str) {
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(run_probe_loop(
            cluster.to_string(),
            self.state.clone(),
            Arc::clone(&self.probe),
            Arc::clone(&self.clock),
            self.config.clone(),
            stopped,
        ));

        let previous = self.loops.write().await.insert(cluster.to_string(), ProbeLoop { task, stop });
        if let Some(previous) = previous {
            previous.halt();
        }
        info!(%cluster, "cluster health monitor started");
    }

    pub async fn stop_monitor(&self, cluster: &str) {
        let removed = self.loops.write().await.remove(cluster);
        if let Some(probe_loop) = removed {
            probe_loop.halt();
            info!(%cluster, "cluster health monitor stopped");
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.loops.write().await.drain().collect();
        for (cluster, probe_loop) in drained {
            probe_loop.halt();
            debug!(%cluster, "cluster health monitor stopped");
        }
        info!("all cluster health monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        self.loops.read().await.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, cluster: &str) -> bool {
        self.loops.read().await.contains_key(cluster)
    }
}

/// The probe loop for a single cluster.
async fn run_probe_loop(
    name: String,
    state: StateStore,
    probe: Arc<dyn ClusterProbe>,
    clock: SharedClock,
    config: MonitorConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let cluster = name.as_str();
    let mut tracker = HealthTracker::new(
        config.failure_threshold,
        config.success_threshold,
        config.interval,
    );

    debug!(%cluster, "probe loop starting");

    loop {
        let interval = tracker.next_interval();

        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let record = match state.get_cluster(cluster) {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        info!(%cluster, "cluster deregistered, probe loop exiting");
                        break;
                    }
                    Err(e) => {
                        error!(%cluster, error = %e, "failed to read cluster");
                        continue;
                    }
                };

                let result = probe.probe(&record).await;
                let Some(status) = tracker.record(result) else {
                    continue;
                };
                if record.ready.as_ref().map(|c| c.status) == Some(status) {
                    continue;
                }

                let deadline = Instant::now() + config.write_timeout;
                if let Err(e) = update_ready_condition(&state, cluster, status, clock.now(), deadline) {
                    error!(%cluster, error = %e, "failed to persist ready condition");
                }
            }
            _ = shutdown.changed() => {
                debug!(%cluster, "probe loop shutting down");
                break;
            }
        }
    }
}

fn condition_reason(status: ConditionStatus) -> (&'static str, &'static str) {
    match status {
        ConditionStatus::True => ("ClusterReady", "cluster is healthy and ready to accept workloads"),
        ConditionStatus::False => ("ClusterNotReady", "cluster is reachable but reports not ready"),
        ConditionStatus::Unknown => ("ClusterUnreachable", "cluster health endpoint is unreachable"),
    }
}

/// Persist the Ready condition of `cluster` via compare-and-swap.
///
/// `last_transition` moves only when the status actually changes.
/// Conflicts are retried with a fresh read until `deadline`. Returns
/// `false` when nothing had to be written.
pub fn update_ready_condition(
    state: &StateStore,
    cluster: &str,
    status: ConditionStatus,
    now: u64,
    deadline: Instant,
) -> StateResult<bool> {
    loop {
        let Some(mut record) = state.get_cluster(cluster)? else {
            return Ok(false);
        };
        if record.ready.as_ref().is_some_and(|c| c.status == status) {
            return Ok(false);
        }

        let (reason, message) = condition_reason(status);
        record.ready = Some(ClusterCondition {
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition: now,
        });

        match state.update_cluster(&record) {
            Ok(_) => {
                info!(%cluster, ?status, "cluster ready condition changed");
                return Ok(true);
            }
            Err(e) if e.is_conflict() && Instant::now() < deadline => {
                debug!(%cluster, "ready condition write conflicted, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::ProbeResult;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedProbe {
        results: Mutex<Vec<ProbeResult>>,
    }

    #[async_trait]
    impl ClusterProbe for ScriptedProbe {
        async fn probe(&self, _cluster: &ClusterRecord) -> ProbeResult {
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0]
            }
        }
    }

    fn test_monitor(store: StateStore, results: Vec<ProbeResult>) -> ClusterHealthMonitor {
        ClusterHealthMonitor::new(
            store,
            Arc::new(ScriptedProbe {
                results: Mutex::new(results),
            }),
            Arc::new(ManualClock::new(1000)),
            MonitorConfig {
                interval: Duration::from_millis(5),
                failure_threshold: 2,
                success_threshold: 1,
                write_timeout: Duration::from_secs(1),
            },
        )
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn ready_condition_written_once_per_transition() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_cluster(&ClusterRecord::new("member1", "http://10.0.0.1")).unwrap();

        assert!(update_ready_condition(&store, "member1", ConditionStatus::True, 100, far_deadline()).unwrap());
        assert!(!update_ready_condition(&store, "member1", ConditionStatus::True, 200, far_deadline()).unwrap());

        let cluster = store.get_cluster("member1").unwrap().unwrap();
        let ready = cluster.ready.unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.last_transition, 100);
        assert_eq!(cluster.resource_version, 2);

        assert!(update_ready_condition(&store, "member1", ConditionStatus::Unknown, 300, far_deadline()).unwrap());
        let ready = store.get_cluster("member1").unwrap().unwrap().ready.unwrap();
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.reason, "ClusterUnreachable");
        assert_eq!(ready.last_transition, 300);
    }

    #[test]
    fn ready_condition_for_missing_cluster_is_noop() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(!update_ready_condition(&store, "ghost", ConditionStatus::True, 1, far_deadline()).unwrap());
    }

    #[tokio::test]
    async fn monitor_starts_and_stops() {
        let store = StateStore::open_in_memory().unwrap();
        let monitor = test_monitor(store, vec![ProbeResult::Healthy]);

        assert!(monitor.active_monitors().await.is_empty());
        monitor.start_monitor("member1").await;
        assert!(monitor.is_monitoring("member1").await);

        monitor.stop_monitor("member1").await;
        assert!(!monitor.is_monitoring("member1").await);
    }

    #[tokio::test]
    async fn monitor_replaces_existing_monitor() {
        let store = StateStore::open_in_memory().unwrap();
        let monitor = test_monitor(store, vec![ProbeResult::Healthy]);

        monitor.start_monitor("member1").await;
        monitor.start_monitor("member1").await;
        monitor.start_monitor("member2").await;

        assert_eq!(monitor.active_monitors().await.len(), 2);
        monitor.stop_all().await;
        assert!(monitor.active_monitors().await.is_empty());
    }

    #[tokio::test]
    async fn monitor_persists_unreachable_condition() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_cluster(&ClusterRecord::new("member1", "http://10.0.0.1")).unwrap();
        let monitor = test_monitor(
            store.clone(),
            vec![ProbeResult::Healthy, ProbeResult::Failed],
        );

        monitor.start_monitor("member1").await;

        let mut status = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = store.get_cluster("member1").unwrap().unwrap().ready.map(|c| c.status);
            if status == Some(ConditionStatus::Unknown) {
                break;
            }
        }
        monitor.stop_all().await;
        assert_eq!(status, Some(ConditionStatus::Unknown));
    }
}
