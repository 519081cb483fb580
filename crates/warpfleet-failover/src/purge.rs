//! Purge planning and execution.
//!
//! A cluster that leaves a binding's assignment gets an eviction task.
//! The task walks `PendingPurge → Purged` (the task disappears) or stays
//! `Retained` forever for `PurgeMode::Never`. `Graciously` waits until the
//! grace period has fully elapsed since the decision; the health of the
//! replacement replica does not shorten or extend that wait.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use warpfleet_state::{
    Binding, BindingConditionKind, ClusterName, ConditionStatus, EvictionReason, EvictionTask, PlacementPolicy,
    PurgeMode, PurgeState, WorkloadRef,
};

use crate::retry::{RetryConfig, retry_with_backoff};

/// What to do with the workload on an abandoned cluster right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeAction {
    /// Delete the workload objects now.
    Delete,
    /// Keep it until the given time, then delete.
    Wait { until: u64 },
    /// Leave it in place indefinitely.
    Retain,
}

/// Per-cluster purge action for a fixed mode.
///
/// A `Graciously` purge without a grace period deletes at once.
pub fn purge_action(mode: PurgeMode, grace_period_seconds: Option<u64>, decision_time: u64, now: u64) -> PurgeAction {
    match mode {
        PurgeMode::Immediately => PurgeAction::Delete,
        PurgeMode::Never => PurgeAction::Retain,
        PurgeMode::Graciously => match grace_period_seconds {
            None => PurgeAction::Delete,
            Some(grace) if now.saturating_sub(decision_time) >= grace => PurgeAction::Delete,
            Some(grace) => PurgeAction::Wait {
                until: decision_time + grace,
            },
        },
    }
}

/// Actions for every cluster in `old` that is missing from `new`.
pub fn purge(
    old: &[ClusterName],
    new: &[ClusterName],
    mode: PurgeMode,
    grace_period_seconds: Option<u64>,
    decision_time: u64,
    now: u64,
) -> Vec<(ClusterName, PurgeAction)> {
    old.iter()
        .filter(|c| !new.contains(c))
        .map(|c| (c.clone(), purge_action(mode, grace_period_seconds, decision_time, now)))
        .collect()
}

/// Purge settings for a cluster dropped for `reason`.
///
/// Application failures follow the application behavior, taint evictions
/// follow the cluster behavior (default `Immediately`). A plain
/// rescheduling purges at once.
pub fn purge_settings(policy: &PlacementPolicy, reason: EvictionReason) -> (PurgeMode, Option<u64>) {
    match reason {
        EvictionReason::ApplicationFailure => policy
            .application_failover()
            .map(|b| (b.purge_mode, b.grace_period_seconds))
            .unwrap_or((PurgeMode::Immediately, None)),
        EvictionReason::TaintUntolerated | EvictionReason::ClusterNotFound => policy
            .cluster_failover()
            .map(|b| (b.purge_mode, b.grace_period_seconds))
            .unwrap_or((PurgeMode::Immediately, None)),
        EvictionReason::Rescheduled => (PurgeMode::Immediately, None),
    }
}

/// New eviction task created at decision time `now`.
pub fn eviction_task(
    cluster: &str,
    reason: EvictionReason,
    message: &str,
    policy: &PlacementPolicy,
    now: u64,
) -> EvictionTask {
    let (purge_mode, grace_period_seconds) = purge_settings(policy, reason);
    EvictionTask {
        from_cluster: cluster.to_string(),
        reason,
        message: message.to_string(),
        purge_mode,
        grace_period_seconds,
        created_at: now,
        state: if purge_mode == PurgeMode::Never {
            PurgeState::Retained
        } else {
            PurgeState::PendingPurge
        },
        attempts: 0,
        last_error: None,
        next_attempt_at: None,
    }
}

/// Spacing between passes that retry a failing delete, in clock seconds.
///
/// Each failed pass doubles the wait, starting at `initial_secs` and
/// capped at `max_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeBackoff {
    pub initial_secs: u64,
    pub max_secs: u64,
}

impl Default for PurgeBackoff {
    fn default() -> Self {
        Self {
            initial_secs: 10,
            max_secs: 300,
        }
    }
}

impl PurgeBackoff {
    /// Wait after the `attempts`-th failed pass.
    pub fn delay(&self, attempts: u32) -> u64 {
        let factor = 1u64.checked_shl(attempts.saturating_sub(1)).unwrap_or(u64::MAX);
        self.initial_secs
            .max(1)
            .saturating_mul(factor)
            .min(self.max_secs.max(1))
    }
}

/// Removes a workload's objects from a member cluster.
///
/// Deleting something already gone must succeed.
#[async_trait]
pub trait WorkloadDeleter: Send + Sync {
    async fn delete(&self, workload: &WorkloadRef, cluster: &str) -> anyhow::Result<()>;
}

/// What one executor run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: Vec<ClusterName>,
    pub failed: Vec<ClusterName>,
    /// Earliest grace deadline or delete retry still pending.
    pub next_check: Option<u64>,
    /// Whether the binding was modified.
    pub changed: bool,
}

/// Runs due eviction tasks against the deletion collaborator.
#[derive(Clone)]
pub struct PurgeExecutor {
    deleter: Arc<dyn WorkloadDeleter>,
    retry: RetryConfig,
    backoff: PurgeBackoff,
}

impl PurgeExecutor {
    pub fn new(deleter: Arc<dyn WorkloadDeleter>, retry: RetryConfig, backoff: PurgeBackoff) -> Self {
        Self { deleter, retry, backoff }
    }

    /// Process every pending task of `binding` at `now`.
    ///
    /// Failed deletes stay pending with the error recorded and raise the
    /// `PurgeFailed` condition. They are not retried before the task's
    /// `next_attempt_at`, which is reported through `next_check`.
    pub async fn execute(&self, binding: &mut Binding, now: u64) -> PurgeReport {
        let mut report = PurgeReport::default();
        let workload = binding.workload.clone();
        let mut remaining = Vec::with_capacity(binding.eviction_tasks.len());

        for mut task in std::mem::take(&mut binding.eviction_tasks) {
            if task.state == PurgeState::Retained {
                remaining.push(task);
                continue;
            }

            match purge_action(task.purge_mode, task.grace_period_seconds, task.created_at, now) {
                PurgeAction::Retain => {
                    task.state = PurgeState::Retained;
                    report.changed = true;
                    remaining.push(task);
                }
                PurgeAction::Wait { until } => {
                    debug!(workload = %workload, cluster = %task.from_cluster, until, "purge waiting for grace period");
                    report.next_check = earliest(report.next_check, until);
                    remaining.push(task);
                }
                PurgeAction::Delete => {
                    if let Some(retry_at) = task.next_attempt_at
                        && now < retry_at
                    {
                        debug!(workload = %workload, cluster = %task.from_cluster, retry_at, "purge backing off");
                        report.next_check = earliest(report.next_check, retry_at);
                        remaining.push(task);
                        continue;
                    }

                    let cluster = task.from_cluster.clone();
                    let result = retry_with_backoff(&self.retry, "delete workload", || {
                        self.deleter.delete(&workload, &cluster)
                    })
                    .await;

                    match result {
                        Ok(()) => {
                            info!(workload = %workload, %cluster, reason = ?task.reason, "workload purged from cluster");
                            report.purged.push(cluster);
                            report.changed = true;
                        }
                        Err(e) => {
                            warn!(workload = %workload, %cluster, error = %e, "workload purge failed");
                            task.attempts += 1;
                            task.last_error = Some(e.to_string());
                            let retry_at = now + self.backoff.delay(task.attempts);
                            task.next_attempt_at = Some(retry_at);
                            report.next_check = earliest(report.next_check, retry_at);
                            report.failed.push(cluster);
                            report.changed = true;
                            remaining.push(task);
                        }
                    }
                }
            }
        }

        binding.eviction_tasks = remaining;
        report.changed |= sync_purge_condition(binding, now);
        report
    }
}

fn earliest(current: Option<u64>, at: u64) -> Option<u64> {
    Some(current.map_or(at, |n| n.min(at)))
}

/// Raise `PurgeFailed` while any pending task carries an error, clear it
/// otherwise. Returns true if the condition changed.
fn sync_purge_condition(binding: &mut Binding, now: u64) -> bool {
    let failing: Vec<&EvictionTask> = binding
        .eviction_tasks
        .iter()
        .filter(|t| t.state == PurgeState::PendingPurge && t.last_error.is_some())
        .collect();

    if failing.is_empty() {
        let raised = binding
            .condition(BindingConditionKind::PurgeFailed)
            .is_some_and(|c| c.status == ConditionStatus::True);
        if !raised {
            return false;
        }
        return binding.set_condition(
            BindingConditionKind::PurgeFailed,
            ConditionStatus::False,
            "PurgeSucceeded",
            "",
            now,
        );
    }

    let message = failing
        .iter()
        .map(|t| format!("{}: {}", t.from_cluster, t.last_error.as_deref().unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("; ");
    binding.set_condition(
        BindingConditionKind::PurgeFailed,
        ConditionStatus::True,
        "DeleteFailed",
        &message,
        now,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use warpfleet_state::{ApplicationFailoverBehavior, ClusterFailoverBehavior, FailoverBehavior, Placement};

    #[derive(Default)]
    struct RecordingDeleter {
        deleted: Mutex<Vec<String>>,
        failing: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkloadDeleter for RecordingDeleter {
        async fn delete(&self, _workload: &WorkloadRef, cluster: &str) -> anyhow::Result<()> {
            if self.failing.lock().unwrap().iter().any(|c| c == cluster) {
                anyhow::bail!("connection refused");
            }
            self.deleted.lock().unwrap().push(cluster.to_string());
            Ok(())
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    fn policy(app_mode: PurgeMode, grace: Option<u64>) -> PlacementPolicy {
        let mut policy = PlacementPolicy::new("default", "nginx", Placement::default());
        policy.failover = Some(FailoverBehavior {
            cluster: None,
            application: Some(ApplicationFailoverBehavior {
                purge_mode: app_mode,
                grace_period_seconds: grace,
                ..Default::default()
            }),
        });
        policy
    }

    fn binding_with(tasks: Vec<EvictionTask>) -> Binding {
        let mut binding = Binding::new(
            WorkloadRef::new("apps/v1", "Deployment", "default", "nginx"),
            "default/nginx",
            vec!["member2".to_string()],
        );
        binding.eviction_tasks = tasks;
        binding
    }

    #[test]
    fn immediate_purge_deletes_at_once() {
        assert_eq!(purge_action(PurgeMode::Immediately, None, 100, 100), PurgeAction::Delete);
    }

    #[test]
    fn gracious_purge_waits_for_full_grace_period() {
        assert_eq!(
            purge_action(PurgeMode::Graciously, Some(10), 100, 109),
            PurgeAction::Wait { until: 110 }
        );
        assert_eq!(purge_action(PurgeMode::Graciously, Some(10), 100, 110), PurgeAction::Delete);
    }

    #[test]
    fn gracious_purge_without_grace_deletes_at_once() {
        assert_eq!(purge_action(PurgeMode::Graciously, None, 100, 100), PurgeAction::Delete);
    }

    #[test]
    fn never_purge_retains() {
        assert_eq!(purge_action(PurgeMode::Never, Some(10), 100, 1_000_000), PurgeAction::Retain);
    }

    #[test]
    fn purge_covers_only_abandoned_clusters() {
        let old = vec!["member1".to_string(), "member2".to_string()];
        let new = vec!["member2".to_string(), "member3".to_string()];
        let actions = purge(&old, &new, PurgeMode::Graciously, Some(30), 0, 10);
        assert_eq!(actions, vec![("member1".to_string(), PurgeAction::Wait { until: 30 })]);
    }

    #[test]
    fn settings_follow_eviction_reason() {
        let mut policy = policy(PurgeMode::Graciously, Some(10));
        assert_eq!(
            purge_settings(&policy, EvictionReason::ApplicationFailure),
            (PurgeMode::Graciously, Some(10))
        );
        assert_eq!(
            purge_settings(&policy, EvictionReason::TaintUntolerated),
            (PurgeMode::Immediately, None)
        );

        policy.failover.as_mut().unwrap().cluster = Some(ClusterFailoverBehavior {
            purge_mode: PurgeMode::Never,
            grace_period_seconds: None,
        });
        assert_eq!(purge_settings(&policy, EvictionReason::TaintUntolerated).0, PurgeMode::Never);
        assert_eq!(purge_settings(&policy, EvictionReason::Rescheduled).0, PurgeMode::Immediately);
    }

    #[test]
    fn never_task_starts_retained() {
        let task = eviction_task("member1", EvictionReason::ApplicationFailure, "", &policy(PurgeMode::Never, None), 5);
        assert_eq!(task.state, PurgeState::Retained);
        assert_eq!(task.created_at, 5);
    }

    #[tokio::test]
    async fn executor_purges_due_tasks_and_keeps_waiting_ones() {
        let policy = policy(PurgeMode::Graciously, Some(10));
        let mut binding = binding_with(vec![
            eviction_task("member1", EvictionReason::ApplicationFailure, "", &policy, 100),
            eviction_task("member3", EvictionReason::Rescheduled, "", &policy, 100),
        ]);
        let deleter = Arc::new(RecordingDeleter::default());
        let executor = PurgeExecutor::new(deleter.clone(), fast_retry(), PurgeBackoff::default());

        let report = executor.execute(&mut binding, 105).await;
        assert_eq!(report.purged, vec!["member3".to_string()]);
        assert_eq!(report.next_check, Some(110));
        assert_eq!(binding.eviction_tasks.len(), 1);

        let report = executor.execute(&mut binding, 110).await;
        assert_eq!(report.purged, vec!["member1".to_string()]);
        assert!(binding.eviction_tasks.is_empty());
        assert_eq!(*deleter.deleted.lock().unwrap(), vec!["member3", "member1"]);
    }

    #[tokio::test]
    async fn executor_never_touches_retained_tasks() {
        let policy = policy(PurgeMode::Never, None);
        let mut binding = binding_with(vec![eviction_task(
            "member1",
            EvictionReason::ApplicationFailure,
            "",
            &policy,
            100,
        )]);
        let deleter = Arc::new(RecordingDeleter::default());
        let executor = PurgeExecutor::new(deleter.clone(), fast_retry(), PurgeBackoff::default());

        let report = executor.execute(&mut binding, 1_000_000).await;
        assert!(!report.changed);
        assert_eq!(binding.eviction_tasks.len(), 1);
        assert!(deleter.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_delete_raises_condition_then_clears() {
        let policy = policy(PurgeMode::Immediately, None);
        let mut binding = binding_with(vec![eviction_task(
            "member1",
            EvictionReason::ApplicationFailure,
            "",
            &policy,
            100,
        )]);
        let deleter = Arc::new(RecordingDeleter::default());
        deleter.failing.lock().unwrap().push("member1".to_string());
        let executor = PurgeExecutor::new(deleter.clone(), fast_retry(), PurgeBackoff::default());

        let report = executor.execute(&mut binding, 100).await;
        assert_eq!(report.failed, vec!["member1".to_string()]);
        let task = &binding.eviction_tasks[0];
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_error.as_deref(), Some("connection refused"));
        assert_eq!(task.next_attempt_at, Some(110));
        assert_eq!(report.next_check, Some(110));
        let cond = binding.condition(BindingConditionKind::PurgeFailed).unwrap();
        assert_eq!(cond.status, ConditionStatus::True);
        assert_eq!(cond.message, "member1: connection refused");

        deleter.failing.lock().unwrap().clear();
        let waiting = executor.execute(&mut binding, 101).await;
        assert!(!waiting.changed);
        assert_eq!(waiting.next_check, Some(110));
        assert!(deleter.deleted.lock().unwrap().is_empty());

        let report = executor.execute(&mut binding, 110).await;
        assert_eq!(report.purged, vec!["member1".to_string()]);
        let cond = binding.condition(BindingConditionKind::PurgeFailed).unwrap();
        assert_eq!(cond.status, ConditionStatus::False);
    }

    #[tokio::test]
    async fn repeated_failures_back_off_and_keep_the_condition() {
        let policy = policy(PurgeMode::Immediately, None);
        let mut binding = binding_with(vec![eviction_task(
            "member1",
            EvictionReason::ApplicationFailure,
            "",
            &policy,
            100,
        )]);
        let deleter = Arc::new(RecordingDeleter::default());
        deleter.failing.lock().unwrap().push("member1".to_string());
        let backoff = PurgeBackoff {
            initial_secs: 5,
            max_secs: 15,
        };
        let executor = PurgeExecutor::new(deleter.clone(), fast_retry(), backoff);

        let mut retry_times = Vec::new();
        let mut now = 100;
        for _ in 0..4 {
            let report = executor.execute(&mut binding, now).await;
            assert_eq!(report.failed, vec!["member1".to_string()]);
            now = binding.eviction_tasks[0].next_attempt_at.unwrap();
            retry_times.push(now);
        }
        assert_eq!(retry_times, vec![105, 115, 130, 145]);
        assert_eq!(binding.eviction_tasks[0].attempts, 4);

        let cond = binding.condition(BindingConditionKind::PurgeFailed).unwrap();
        assert_eq!(cond.last_transition, 100);
        assert_eq!(cond.message, "member1: connection refused");
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = PurgeBackoff::default();
        let delays: Vec<u64> = (1..=7).map(|n| backoff.delay(n)).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(backoff.delay(200), 300);
    }
}
