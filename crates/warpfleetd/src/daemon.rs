//! Process wiring: seed the store, probe every registered cluster and run
//! the failover controller until shutdown.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use warpfleet_failover::FailoverController;
use warpfleet_health::ClusterHealthMonitor;
use warpfleet_placement::ScoringResolver;
use warpfleet_state::{SharedClock, StateStore, StoreEvent, Versioned};

use crate::config::FleetConfig;
use crate::member::MemberClient;

/// Records created by [`seed_store`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub clusters: usize,
    pub policies: usize,
    pub bindings: usize,
}

/// Write the configured seed records that are not in the store yet.
/// Existing records are left untouched.
pub fn seed_store(state: &StateStore, config: &FleetConfig) -> anyhow::Result<SeedReport> {
    let mut report = SeedReport::default();

    for seed in &config.clusters {
        if state.get_cluster(&seed.name)?.is_none() {
            state.create_cluster(&seed.to_record())?;
            report.clusters += 1;
        } else {
            debug!(cluster = %seed.name, "cluster already registered");
        }
    }

    for policy in &config.policies {
        let key = policy.table_key();
        if state.get_policy(&key)?.is_none() {
            state.create_policy(policy)?;
            report.policies += 1;
        } else {
            debug!(policy = %key, "policy already present");
        }
    }

    for seed in &config.bindings {
        let binding = seed.to_binding();
        let key = binding.table_key();
        if state.get_binding(&key)?.is_none() {
            state.create_binding(&binding)?;
            report.bindings += 1;
        } else {
            debug!(binding = %key, "binding already present");
        }
    }

    Ok(report)
}

/// Run the daemon until `shutdown` flips.
pub async fn run(
    config: FleetConfig,
    state: StateStore,
    clock: SharedClock,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let seeded = seed_store(&state, &config)?;
    info!(
        clusters = seeded.clusters,
        policies = seeded.policies,
        bindings = seeded.bindings,
        "seed records written"
    );

    let monitor = Arc::new(ClusterHealthMonitor::new(
        state.clone(),
        Arc::new(config.cluster_probe()),
        Arc::clone(&clock),
        config.monitor_config(),
    ));
    for cluster in state.list_clusters()? {
        monitor.start_monitor(&cluster.name).await;
    }

    let member = Arc::new(MemberClient::new(state.clone(), Arc::clone(&clock), config.probe.timeout));
    let controller = Arc::new(
        FailoverController::new(
            state.clone(),
            Arc::clone(&clock),
            Arc::new(ScoringResolver::default()),
            member.clone(),
            config.controller_config(),
        )
        .with_workload_probe(member),
    );

    let controller_handle = tokio::spawn(Arc::clone(&controller).run(shutdown.clone()));
    let watcher_handle = tokio::spawn(watch_clusters(state, Arc::clone(&monitor), shutdown));

    let controller_done = join_task("failover controller", controller_handle).await;
    let watcher_done = join_task("cluster watcher", watcher_handle).await;
    monitor.stop_all().await;

    controller_done.and(watcher_done)
}

/// Wait for a daemon task, turning a panic or cancellation into an error.
async fn join_task(name: &str, handle: JoinHandle<()>) -> anyhow::Result<()> {
    handle.await.map_err(|e| {
        error!(task = name, error = %e, "daemon task ended abnormally");
        anyhow::Error::new(e).context(format!("{name} task failed"))
    })
}

/// Keep one probe loop per registered cluster as clusters come and go.
async fn watch_clusters(state: StateStore, monitor: Arc<ClusterHealthMonitor>, mut shutdown: watch::Receiver<bool>) {
    let mut events = state.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(StoreEvent::Cluster(name)) => sync_monitor(&state, &monitor, &name).await,
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "cluster watch lagged, resyncing monitors");
                    let mut names = monitor.active_monitors().await;
                    match state.list_clusters() {
                        Ok(clusters) => names.extend(clusters.into_iter().map(|c| c.name)),
                        Err(e) => warn!(error = %e, "failed to list clusters"),
                    }
                    names.sort();
                    names.dedup();
                    for name in names {
                        sync_monitor(&state, &monitor, &name).await;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn sync_monitor(state: &StateStore, monitor: &ClusterHealthMonitor, cluster: &str) {
    match state.get_cluster(cluster) {
        Ok(Some(_)) => {
            if !monitor.is_monitoring(cluster).await {
                monitor.start_monitor(cluster).await;
            }
        }
        Ok(None) => monitor.stop_monitor(cluster).await,
        Err(e) => warn!(%cluster, error = %e, "failed to read cluster"),
    }
}
