//! Failover controller: the reconciliation driver.
//!
//! Cluster keys run the taint manager and fan out to the bindings that
//! touch the cluster. Binding keys observe workload health, decide,
//! reschedule and commit in one compare-and-swap, then run due purges
//! and commit again. Every pass starts from persisted state, runs under
//! a deadline and may be repeated at will.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use warpfleet_health::{WorkloadObservation, WorkloadProbe, record_observation};
use warpfleet_placement::PlacementResolver;
use warpfleet_state::{
    Binding, BindingConditionKind, ClusterName, ClusterRecord, ConditionStatus, PurgeState, SharedClock, StateStore,
    StoreEvent, Versioned,
};

use crate::decision::{FailoverDecision, decide};
use crate::error::{FailoverError, FailoverResult};
use crate::purge::{PurgeBackoff, PurgeExecutor, PurgeReport, WorkloadDeleter};
use crate::queue::{ReconcileKey, WorkQueue};
use crate::reschedule::{RescheduleOutcome, apply_assignment, clear_degraded, mark_degraded, reschedule};
use crate::retry::{RetryConfig, retry_on_conflict};
use crate::taint::{TaintConfig, TaintManager};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Full re-evaluation interval, covers missed events.
    pub resync_interval: Duration,
    /// Deadline for one reconciliation pass.
    pub pass_timeout: Duration,
    pub workers: usize,
    /// Backoff inside one pass.
    pub purge_retry: RetryConfig,
    /// Backoff between passes while a delete keeps failing.
    pub purge_backoff: PurgeBackoff,
    pub taints: TaintConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            pass_timeout: Duration::from_secs(10),
            workers: 4,
            purge_retry: RetryConfig::default(),
            purge_backoff: PurgeBackoff::default(),
            taints: TaintConfig::default(),
        }
    }
}

/// What one binding pass did.
#[derive(Debug, Clone, Default)]
pub struct BindingOutcome {
    pub decision: FailoverDecision,
    pub rescheduled: Option<Vec<ClusterName>>,
    /// Message of a deferred (infeasible) rescheduling.
    pub deferred: Option<String>,
    pub purge: PurgeReport,
    /// Whether the decision phase wrote the binding.
    pub written: bool,
    /// When the binding should be looked at again.
    pub next_check: Option<u64>,
}

pub struct FailoverController {
    state: StateStore,
    clock: SharedClock,
    resolver: Arc<dyn PlacementResolver>,
    workload_probe: Option<Arc<dyn WorkloadProbe>>,
    purger: PurgeExecutor,
    taints: TaintManager,
    config: ControllerConfig,
    queue: Arc<WorkQueue<ReconcileKey>>,
}

fn earliest(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl FailoverController {
    pub fn new(
        state: StateStore,
        clock: SharedClock,
        resolver: Arc<dyn PlacementResolver>,
        deleter: Arc<dyn WorkloadDeleter>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            state,
            clock,
            resolver,
            workload_probe: None,
            purger: PurgeExecutor::new(deleter, config.purge_retry.clone(), config.purge_backoff),
            taints: TaintManager::new(config.taints.clone()),
            config,
            queue: Arc::new(WorkQueue::new()),
        }
    }

    /// Enable application-level observation through `probe`.
    pub fn with_workload_probe(mut self, probe: Arc<dyn WorkloadProbe>) -> Self {
        self.workload_probe = Some(probe);
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ReconcileKey>> {
        &self.queue
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.pass_timeout
    }

    /// Sync the taints of `cluster` and queue every binding that targets
    /// it or still has cleanup pending on it.
    pub async fn reconcile_cluster(&self, cluster: &str) -> FailoverResult<Vec<String>> {
        let now = self.clock.now();
        let record = self.taints.reconcile(&self.state, cluster, now, self.deadline()).await?;
        if record.is_none() {
            debug!(%cluster, "cluster gone, re-evaluating its bindings");
        }

        let affected: Vec<String> = self
            .state
            .list_bindings_for_cluster(cluster)?
            .iter()
            .map(Versioned::table_key)
            .collect();
        for id in &affected {
            self.queue.add(ReconcileKey::Binding(id.clone()));
        }
        Ok(affected)
    }

    /// Run one full pass over binding `id`. Returns `None` if the binding
    /// no longer exists.
    pub async fn reconcile_binding(&self, id: &str) -> FailoverResult<Option<BindingOutcome>> {
        let now = self.clock.now();
        let deadline = self.deadline();

        let Some(binding) = self.state.get_binding(id)? else {
            debug!(binding = %id, "binding gone");
            return Ok(None);
        };
        let policy = self
            .state
            .get_policy(&binding.policy)?
            .ok_or_else(|| FailoverError::PolicyNotFound(binding.policy.clone()))?;

        let observations = if policy.application_failover().is_some() {
            self.observe_workloads(&binding).await
        } else {
            Vec::new()
        };

        let observations = &observations;
        let decided = retry_on_conflict(deadline, "binding decision", || async move {
            self.decide_and_commit(id, observations, now).await
        })
        .await?;
        let Some(mut outcome) = decided else {
            return Ok(None);
        };

        outcome.purge = retry_on_conflict(deadline, "binding purge", || async move {
            self.purge_and_commit(id, now).await
        })
        .await?;
        outcome.next_check = earliest(outcome.next_check, outcome.purge.next_check);

        Ok(Some(outcome))
    }

    async fn observe_workloads(&self, binding: &Binding) -> Vec<(ClusterName, WorkloadObservation)> {
        let Some(probe) = &self.workload_probe else {
            return Vec::new();
        };

        let mut observations = Vec::with_capacity(binding.clusters.len());
        for cluster in &binding.clusters {
            match probe.probe(&binding.workload, cluster).await {
                Ok(observation) => observations.push((cluster.clone(), observation)),
                Err(e) => {
                    debug!(workload = %binding.workload, %cluster, error = %e, "workload probe failed, no observation")
                }
            }
        }
        observations
    }

    fn workload_counts(&self) -> FailoverResult<HashMap<ClusterName, u32>> {
        let mut counts = HashMap::new();
        for binding in self.state.list_bindings()? {
            for cluster in binding.clusters {
                *counts.entry(cluster).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn decide_and_commit(
        &self,
        id: &str,
        observations: &[(ClusterName, WorkloadObservation)],
        now: u64,
    ) -> FailoverResult<Option<BindingOutcome>> {
        let Some(mut binding) = self.state.get_binding(id)? else {
            return Ok(None);
        };
        let policy = self
            .state
            .get_policy(&binding.policy)?
            .ok_or_else(|| FailoverError::PolicyNotFound(binding.policy.clone()))?;
        let clusters: Vec<ClusterRecord> = self.state.list_clusters()?;

        let mut changed = false;
        for (cluster, observation) in observations {
            changed |= record_observation(&mut binding, cluster, *observation, now);
        }

        let by_name: HashMap<ClusterName, ClusterRecord> =
            clusters.iter().map(|c| (c.name.clone(), c.clone())).collect();
        let decision = decide(&binding, &by_name, &policy, now);
        let mut outcome = BindingOutcome {
            next_check: decision.next_check,
            decision: decision.clone(),
            ..Default::default()
        };

        if decision.needs_reschedule() {
            info!(binding = %id, evict = ?decision.evict, "toleration exceeded, rescheduling");
            let counts = self.workload_counts()?;
            match reschedule(&binding, &clusters, &policy, &decision, self.resolver.as_ref(), &counts).await {
                RescheduleOutcome::Assigned(assignment) => {
                    outcome.rescheduled = Some(assignment.clone());
                    changed |= apply_assignment(&mut binding, assignment, &decision, &policy, now);
                }
                RescheduleOutcome::Deferred(message) => {
                    changed |= mark_degraded(&mut binding, &message, now);
                    outcome.deferred = Some(message);
                }
                RescheduleOutcome::Unchanged => {}
            }
        } else {
            changed |= clear_degraded(&mut binding, now);
        }

        if changed {
            self.state.update_binding(&binding)?;
            outcome.written = true;
        }
        Ok(Some(outcome))
    }

    async fn purge_and_commit(&self, id: &str, now: u64) -> FailoverResult<PurgeReport> {
        let Some(mut binding) = self.state.get_binding(id)? else {
            return Ok(PurgeReport::default());
        };

        let pending = binding
            .eviction_tasks
            .iter()
            .any(|t| t.state == PurgeState::PendingPurge);
        let failing = binding
            .condition(BindingConditionKind::PurgeFailed)
            .is_some_and(|c| c.status == ConditionStatus::True);
        if !pending && !failing {
            return Ok(PurgeReport::default());
        }

        let report = self.purger.execute(&mut binding, now).await;
        if report.changed {
            self.state.update_binding(&binding)?;
        }
        Ok(report)
    }

    /// Run the pass for `key` under the pass deadline and schedule a
    /// follow-up at the next window expiry.
    pub async fn process(&self, key: &ReconcileKey) {
        let pass = async {
            match key {
                ReconcileKey::Cluster(name) => self.reconcile_cluster(name).await.map(|_| None),
                ReconcileKey::Binding(id) => self
                    .reconcile_binding(id)
                    .await
                    .map(|outcome| outcome.and_then(|o| o.next_check)),
            }
        };

        match tokio::time::timeout(self.config.pass_timeout, pass).await {
            Err(_) => {
                let e = FailoverError::Timeout(self.config.pass_timeout);
                warn!(?key, error = %e, "reconciliation aborted");
            }
            Ok(Err(e)) => error!(?key, error = %e, "reconciliation failed"),
            Ok(Ok(Some(at))) => {
                let delay = at.saturating_sub(self.clock.now()).max(1);
                debug!(?key, delay_secs = delay, "requeue scheduled");
                self.queue.add_after(key.clone(), Duration::from_secs(delay));
            }
            Ok(Ok(None)) => {}
        }
    }

    /// Queue every cluster and binding.
    pub fn enqueue_all(&self) -> FailoverResult<()> {
        for cluster in self.state.list_clusters()? {
            self.queue.add(ReconcileKey::Cluster(cluster.name));
        }
        for binding in self.state.list_bindings()? {
            self.queue.add(ReconcileKey::Binding(binding.table_key()));
        }
        Ok(())
    }

    fn handle_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Cluster(name) => self.queue.add(ReconcileKey::Cluster(name)),
            StoreEvent::Binding(id) => self.queue.add(ReconcileKey::Binding(id)),
            StoreEvent::Policy(id) => match self.state.list_bindings_for_policy(&id) {
                Ok(bindings) => {
                    for binding in &bindings {
                        self.queue.add(ReconcileKey::Binding(binding.table_key()));
                    }
                }
                Err(e) => warn!(policy = %id, error = %e, "failed to list bindings for policy"),
            },
        }
    }

    /// Run workers, the event subscription and the periodic resync until
    /// shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            resync_secs = self.config.resync_interval.as_secs(),
            "failover controller started"
        );

        let mut events = self.state.subscribe();
        if let Err(e) = self.enqueue_all() {
            error!(error = %e, "initial enqueue failed");
        }

        let mut workers = Vec::with_capacity(self.config.workers);
        for worker in 0..self.config.workers.max(1) {
            let this = Arc::clone(&self);
            workers.push(tokio::spawn(async move {
                while let Some(key) = this.queue.next().await {
                    this.process(&key).await;
                    this.queue.done(&key);
                }
                debug!(worker, "worker exiting");
            }));
        }

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "store events lagged, resyncing");
                        if let Err(e) = self.enqueue_all() {
                            error!(error = %e, "resync enqueue failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        info!("store event channel closed");
                        break;
                    }
                },
                _ = resync.tick() => {
                    debug!("periodic resync");
                    if let Err(e) = self.enqueue_all() {
                        error!(error = %e, "resync enqueue failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("failover controller shutting down");
                    break;
                }
            }
        }

        self.queue.shutdown();
        for worker in workers {
            let _ = worker.await;
        }
    }
}
