//! StateStore: redb-backed state persistence for WarpFleet.
//!
//! Provides typed CRUD operations over clusters, placement policies, and
//! bindings. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).
//!
//! Writes go through `create_*` (key must be absent) or `update_*`
//! (compare-and-swap on `resource_version`). There is no blind upsert.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Capacity of the change-event channel. Slow subscribers lag and are
/// expected to fall back to a full resync.
const EVENT_CAPACITY: usize = 1024;

/// A record changed (created, updated, or deleted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Cluster(ClusterName),
    Policy(PolicyId),
    Binding(BindingId),
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(POLICIES).map_err(map_err!(Table))?;
        txn.open_table(BINDINGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to change events for all records.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Write `record` if the stored version equals `expected`
    /// (0 = absent). Returns the record at its new version.
    fn compare_and_swap<T>(&self, table: Table, record: &T, expected: u64) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned + Versioned + Clone,
    {
        let key = record.table_key();
        let mut next = record.clone();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let actual = table
                .get(key.as_str())
                .map_err(map_err!(Read))?
                .map(|guard| {
                    serde_json::from_slice::<T>(guard.value()).map(|stored| stored.resource_version())
                })
                .transpose()
                .map_err(map_err!(Deserialize))?
                .unwrap_or(0);

            if actual != expected {
                Err(actual)
            } else {
                next.set_resource_version(actual + 1);
                let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                Ok(())
            }
        };

        match outcome {
            Ok(()) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(next)
            }
            Err(actual) => {
                txn.abort().map_err(map_err!(Transaction))?;
                if expected == 0 {
                    return Err(StateError::AlreadyExists(key));
                }
                debug!(%key, expected, actual, "write conflict");
                Err(StateError::Conflict {
                    key,
                    expected,
                    actual,
                })
            }
        }
    }

    fn create<T>(&self, table: Table, record: &T) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned + Versioned + Clone,
    {
        self.compare_and_swap(table, record, 0)
    }

    fn update<T>(&self, table: Table, record: &T) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned + Versioned + Clone,
    {
        let expected = record.resource_version();
        if expected == 0 {
            return Err(StateError::NotFound(record.table_key()));
        }
        self.compare_and_swap(table, record, expected)
    }

    fn delete(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Register a new cluster. Fails if the name is taken.
    pub fn create_cluster(&self, cluster: &ClusterRecord) -> StateResult<ClusterRecord> {
        let stored = self.create(CLUSTERS, cluster)?;
        debug!(cluster = %stored.name, "cluster created");
        self.publish(StoreEvent::Cluster(stored.name.clone()));
        Ok(stored)
    }

    /// Get a cluster by name.
    pub fn get_cluster(&self, name: &str) -> StateResult<Option<ClusterRecord>> {
        self.get(CLUSTERS, name)
    }

    /// List all clusters.
    pub fn list_clusters(&self) -> StateResult<Vec<ClusterRecord>> {
        self.list(CLUSTERS)
    }

    /// Compare-and-swap a cluster read at `cluster.resource_version`.
    pub fn update_cluster(&self, cluster: &ClusterRecord) -> StateResult<ClusterRecord> {
        let stored = self.update(CLUSTERS, cluster)?;
        debug!(cluster = %stored.name, version = stored.resource_version, "cluster updated");
        self.publish(StoreEvent::Cluster(stored.name.clone()));
        Ok(stored)
    }

    /// Delete a cluster by name. Returns true if it existed.
    pub fn delete_cluster(&self, name: &str) -> StateResult<bool> {
        let existed = self.delete(CLUSTERS, name)?;
        if existed {
            self.publish(StoreEvent::Cluster(name.to_string()));
        }
        Ok(existed)
    }

    // ── Policies ───────────────────────────────────────────────────

    pub fn create_policy(&self, policy: &PlacementPolicy) -> StateResult<PlacementPolicy> {
        let stored = self.create(POLICIES, policy)?;
        let key = stored.table_key();
        debug!(%key, "policy created");
        self.publish(StoreEvent::Policy(key));
        Ok(stored)
    }

    /// Get a policy by namespace/name key.
    pub fn get_policy(&self, key: &str) -> StateResult<Option<PlacementPolicy>> {
        self.get(POLICIES, key)
    }

    pub fn list_policies(&self) -> StateResult<Vec<PlacementPolicy>> {
        self.list(POLICIES)
    }

    pub fn update_policy(&self, policy: &PlacementPolicy) -> StateResult<PlacementPolicy> {
        let stored = self.update(POLICIES, policy)?;
        let key = stored.table_key();
        debug!(%key, version = stored.resource_version, "policy updated");
        self.publish(StoreEvent::Policy(key));
        Ok(stored)
    }

    pub fn delete_policy(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete(POLICIES, key)?;
        if existed {
            self.publish(StoreEvent::Policy(key.to_string()));
        }
        Ok(existed)
    }

    // ── Bindings ───────────────────────────────────────────────────

    pub fn create_binding(&self, binding: &Binding) -> StateResult<Binding> {
        let stored = self.create(BINDINGS, binding)?;
        let key = stored.table_key();
        debug!(%key, clusters = ?stored.clusters, "binding created");
        self.publish(StoreEvent::Binding(key));
        Ok(stored)
    }

    /// Get a binding by namespace/name key.
    pub fn get_binding(&self, key: &str) -> StateResult<Option<Binding>> {
        self.get(BINDINGS, key)
    }

    pub fn list_bindings(&self) -> StateResult<Vec<Binding>> {
        self.list(BINDINGS)
    }

    /// Bindings that target `cluster` or still hold an eviction task for it.
    pub fn list_bindings_for_cluster(&self, cluster: &str) -> StateResult<Vec<Binding>> {
        Ok(self
            .list_bindings()?
            .into_iter()
            .filter(|b| {
                b.clusters.iter().any(|c| c == cluster) || b.eviction_task_for(cluster).is_some()
            })
            .collect())
    }

    /// Bindings governed by the policy with the given key.
    pub fn list_bindings_for_policy(&self, policy: &str) -> StateResult<Vec<Binding>> {
        Ok(self
            .list_bindings()?
            .into_iter()
            .filter(|b| b.policy == policy)
            .collect())
    }

    pub fn update_binding(&self, binding: &Binding) -> StateResult<Binding> {
        let stored = self.update(BINDINGS, binding)?;
        let key = stored.table_key();
        debug!(%key, version = stored.resource_version, "binding updated");
        self.publish(StoreEvent::Binding(key));
        Ok(stored)
    }

    pub fn delete_binding(&self, key: &str) -> StateResult<bool> {
        let existed = self.delete(BINDINGS, key)?;
        if existed {
            self.publish(StoreEvent::Binding(key.to_string()));
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cluster(name: &str) -> ClusterRecord {
        ClusterRecord::new(name, "https://10.0.0.1:6443").with_label("location", "CHN")
    }

    fn test_policy(name: &str) -> PlacementPolicy {
        PlacementPolicy::new(
            "default",
            name,
            Placement {
                cluster_affinity: None,
                cluster_tolerations: vec![Toleration::not_ready(2)],
                spread_constraints: vec![SpreadConstraint::by_cluster(1, 1)],
                ..Default::default()
            },
        )
    }

    fn test_binding(name: &str, clusters: &[&str]) -> Binding {
        Binding::new(
            WorkloadRef::new("apps/v1", "Deployment", "default", name),
            &format!("default/{name}"),
            clusters.iter().map(|c| c.to_string()).collect(),
        )
    }

    // ── Cluster CRUD ───────────────────────────────────────────────

    #[test]
    fn cluster_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.create_cluster(&test_cluster("member1")).unwrap();

        assert_eq!(stored.resource_version, 1);
        let retrieved = store.get_cluster("member1").unwrap();
        assert_eq!(retrieved, Some(stored));
    }

    #[test]
    fn cluster_create_twice_fails() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_cluster(&test_cluster("member1")).unwrap();

        let err = store.create_cluster(&test_cluster("member1")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn cluster_update_bumps_version() {
        let store = StateStore::open_in_memory().unwrap();
        let mut cluster = store.create_cluster(&test_cluster("member1")).unwrap();

        cluster.taints.push(Taint::new("fail-test", TaintEffect::NoExecute).added_at(10));
        let updated = store.update_cluster(&cluster).unwrap();

        assert_eq!(updated.resource_version, 2);
        assert_eq!(store.get_cluster("member1").unwrap().unwrap().taints.len(), 1);
    }

    #[test]
    fn stale_update_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        let original = store.create_cluster(&test_cluster("member1")).unwrap();

        let mut first = original.clone();
        first.api_endpoint = "https://172.19.1.3:6443".to_string();
        store.update_cluster(&first).unwrap();

        let mut stale = original;
        stale.labels.insert("zone".to_string(), "a".to_string());
        let err = store.update_cluster(&stale).unwrap_err();
        assert!(err.is_conflict());
        match err {
            StateError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The losing write left nothing behind.
        let stored = store.get_cluster("member1").unwrap().unwrap();
        assert!(!stored.labels.contains_key("zone"));
    }

    #[test]
    fn update_of_unstored_record_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.update_cluster(&test_cluster("ghost")).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn update_after_delete_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = store.create_cluster(&test_cluster("member1")).unwrap();
        assert!(store.delete_cluster("member1").unwrap());

        let err = store.update_cluster(&cluster).unwrap_err();
        assert!(err.is_conflict());
    }

    // ── Policy / Binding CRUD ──────────────────────────────────────

    #[test]
    fn policy_roundtrip_through_table() {
        let store = StateStore::open_in_memory().unwrap();
        let mut policy = test_policy("nginx");
        policy.failover = Some(FailoverBehavior {
            cluster: None,
            application: Some(ApplicationFailoverBehavior {
                decision_conditions: DecisionConditions { toleration_seconds: 30 },
                purge_mode: PurgeMode::Graciously,
                grace_period_seconds: Some(10),
            }),
        });
        let stored = store.create_policy(&policy).unwrap();

        let retrieved = store.get_policy("default/nginx").unwrap().unwrap();
        assert_eq!(retrieved, stored);
        assert_eq!(
            retrieved.application_failover().unwrap().grace_period_seconds,
            Some(10)
        );
    }

    #[test]
    fn bindings_filtered_by_cluster_and_policy() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_binding(&test_binding("a", &["member1"])).unwrap();
        store.create_binding(&test_binding("b", &["member2"])).unwrap();
        let mut c = test_binding("c", &["member2"]);
        c.eviction_tasks.push(EvictionTask {
            from_cluster: "member1".to_string(),
            reason: EvictionReason::ApplicationFailure,
            message: String::new(),
            purge_mode: PurgeMode::Never,
            grace_period_seconds: None,
            created_at: 10,
            state: PurgeState::Retained,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
        });
        store.create_binding(&c).unwrap();

        let on_member1 = store.list_bindings_for_cluster("member1").unwrap();
        assert_eq!(on_member1.len(), 2);

        let for_b = store.list_bindings_for_policy("default/b").unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].clusters, vec!["member2".to_string()]);
    }

    #[test]
    fn binding_key_uses_workload_name_and_kind() {
        let binding = test_binding("nginx", &["member1"]);
        assert_eq!(binding.table_key(), "default/nginx-deployment");
    }

    // ── Events ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn writes_publish_events() {
        let store = StateStore::open_in_memory().unwrap();
        let mut events = store.subscribe();

        let cluster = store.create_cluster(&test_cluster("member1")).unwrap();
        store.update_cluster(&cluster).unwrap();
        store.create_binding(&test_binding("nginx", &["member1"])).unwrap();
        store.delete_cluster("member1").unwrap();

        assert_eq!(events.recv().await.unwrap(), StoreEvent::Cluster("member1".to_string()));
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Cluster("member1".to_string()));
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::Binding("default/nginx-deployment".to_string())
        );
        assert_eq!(events.recv().await.unwrap(), StoreEvent::Cluster("member1".to_string()));
    }

    #[test]
    fn failed_write_publishes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = store.create_cluster(&test_cluster("member1")).unwrap();
        let mut events = store.subscribe();

        store.update_cluster(&cluster).unwrap();
        assert!(store.update_cluster(&cluster).is_err());

        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.create_cluster(&test_cluster("member1")).unwrap();
            store.create_binding(&test_binding("nginx", &["member1"])).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let cluster = store.get_cluster("member1").unwrap().unwrap();
        assert_eq!(cluster.resource_version, 1);
        assert_eq!(store.list_bindings().unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_clusters().unwrap().is_empty());
        assert!(store.list_policies().unwrap().is_empty());
        assert!(store.list_bindings().unwrap().is_empty());
        assert!(store.get_cluster("nope").unwrap().is_none());
        assert!(!store.delete_cluster("nope").unwrap());
        assert!(!store.delete_binding("nope").unwrap());
        assert!(!store.delete_policy("nope").unwrap());
    }
}
