//! Deduplicating work queue for reconciliation keys.
//!
//! A key is queued at most once. A key handed to a worker is not handed
//! out again until `done` is called; if it was added in the meantime it
//! is queued once more at that point. Each key has at most one pending
//! delayed add; only the earliest deadline is kept.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// What a reconciliation pass works on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReconcileKey {
    Cluster(String),
    Binding(String),
}

struct QueueState<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    /// Added while processing; re-queued on `done`.
    dirty: HashSet<K>,
    /// Deadline of the one timer armed per key.
    delayed: HashMap<K, Instant>,
    shut_down: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash + Send + 'static> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash + Send + 'static> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                delayed: HashMap::new(),
                shut_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` after `delay`. A no-op if the key already has an earlier
    /// or equal deadline pending.
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shut_down || state.delayed.get(&key).is_some_and(|armed| *armed <= deadline) {
                return;
            }
            state.delayed.insert(key.clone(), deadline);
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut state = queue.lock();
                if state.delayed.get(&key) == Some(&deadline) {
                    state.delayed.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    /// Keys waiting on a delayed add.
    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as finished.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shut_down && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wake every waiter and refuse further work.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shut_down = true;
        state.delayed.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ReconcileKey {
        ReconcileKey::Binding(name.to_string())
    }

    #[tokio::test]
    async fn duplicate_adds_are_collapsed() {
        let queue = WorkQueue::new();
        queue.add(key("default/nginx"));
        queue.add(key("default/nginx"));
        queue.add(key("default/redis"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.next().await, Some(key("default/nginx")));
        assert_eq!(queue.next().await, Some(key("default/redis")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_requeued_after_done() {
        let queue = WorkQueue::new();
        queue.add(key("default/nginx"));
        let k = queue.next().await.unwrap();

        queue.add(key("default/nginx"));
        assert!(queue.is_empty());

        queue.done(&k);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some(key("default/nginx")));
    }

    #[tokio::test]
    async fn done_without_changes_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add(key("default/nginx"));
        let k = queue.next().await.unwrap();
        queue.done(&k);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let queue: Arc<WorkQueue<ReconcileKey>> = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("default/nginx"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn waiter_wakes_on_add() {
        let queue: Arc<WorkQueue<ReconcileKey>> = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        queue.add(ReconcileKey::Cluster("member1".to_string()));
        assert_eq!(waiter.await.unwrap(), Some(ReconcileKey::Cluster("member1".to_string())));
    }

    #[tokio::test]
    async fn add_after_delays_the_key() {
        let queue: Arc<WorkQueue<ReconcileKey>> = Arc::new(WorkQueue::new());
        queue.add_after(key("default/nginx"), Duration::from_millis(10));
        assert!(queue.is_empty());

        let next = tokio::time::timeout(Duration::from_secs(2), queue.next()).await.unwrap();
        assert_eq!(next, Some(key("default/nginx")));
    }

    #[tokio::test]
    async fn repeated_add_after_keeps_one_deadline() {
        let queue: Arc<WorkQueue<ReconcileKey>> = Arc::new(WorkQueue::new());
        for _ in 0..5 {
            queue.add_after(key("default/nginx"), Duration::from_secs(3600));
        }
        assert_eq!(queue.delayed_len(), 1);

        queue.add_after(key("default/nginx"), Duration::from_millis(10));
        assert_eq!(queue.delayed_len(), 1);

        let next = tokio::time::timeout(Duration::from_secs(2), queue.next()).await.unwrap();
        assert_eq!(next, Some(key("default/nginx")));
        assert_eq!(queue.delayed_len(), 0);
    }
}
