//! Versioned per-`(branch, module)` sync state.
//!
//! [`StateStore`] caches one [`SyncState`] per key and is the only path that
//! mutates module tables. Loads and mutations for the same key are
//! serialized through a per-key async lock, so concurrent cache misses hit
//! storage once and an apply never interleaves with another apply.

use std::collections::HashMap;
use std::sync::Arc;

use branchsync_core::json::now_iso;
use branchsync_core::store::{
    ModuleSnapshot, ModuleStorage, ModuleStore, MutationAction, MutationContext, MutationOutcome,
    TableDefinition,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::SyncError;
use crate::insert_only::{
    IncomingSnapshot, normalize, summarize_table_counts, validate_insert_only,
};

type StateKey = (String, String);

/// Cached snapshot of one module for one branch.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncState {
    /// Branch identifier.
    pub branch_id: String,
    /// Module identifier.
    pub module_id: String,
    /// Version of [`Self::module_snapshot`].
    pub version: u64,
    /// Full table contents.
    pub module_snapshot: ModuleSnapshot,
    /// When the snapshot last changed.
    pub updated_at: String,
}

impl SyncState {
    fn from_snapshot(branch_id: &str, module_id: &str, snapshot: ModuleSnapshot) -> Self {
        let updated_at = snapshot.last_updated_at().map_or_else(now_iso, str::to_owned);
        Self {
            branch_id: branch_id.to_owned(),
            module_id: module_id.to_owned(),
            version: snapshot.version,
            module_snapshot: snapshot,
            updated_at,
        }
    }
}

/// Options of a snapshot apply.
#[derive(Clone, Debug, Default)]
pub struct ApplyContext {
    /// Fill absent tables from the current snapshot instead of rejecting.
    pub partial: bool,
    /// Provenance forwarded to storage.
    pub mutation: MutationContext,
}

/// Owner of every [`SyncState`].
pub struct StateStore {
    storage: Arc<dyn ModuleStorage>,
    server_id: String,
    states: RwLock<HashMap<StateKey, Arc<SyncState>>>,
    locks: Mutex<HashMap<StateKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl StateStore {
    /// Create a store over the given storage collaborator.
    pub fn new(storage: Arc<dyn ModuleStorage>, server_id: impl Into<String>) -> Self {
        Self {
            storage,
            server_id: server_id.into(),
            states: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The storage collaborator.
    pub fn storage(&self) -> &Arc<dyn ModuleStorage> {
        &self.storage
    }

    /// Cached state, without loading.
    pub fn get(&self, branch_id: &str, module_id: &str) -> Option<Arc<SyncState>> {
        self.states
            .read()
            .get(&(branch_id.to_owned(), module_id.to_owned()))
            .cloned()
    }

    /// Number of cached states.
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether nothing is cached yet.
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    fn key_lock(&self, key: &StateKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(key.clone()).or_default().clone()
    }

    fn install(&self, state: SyncState) -> Arc<SyncState> {
        let state = Arc::new(state);
        let key = (state.branch_id.clone(), state.module_id.clone());
        let _ = self.states.write().insert(key, state.clone());
        state
    }

    /// Cached state, loading it from storage on a miss.
    ///
    /// Storage failures fall back to an empty version-1 snapshot, which is
    /// returned but not cached.
    pub async fn ensure_state(&self, branch_id: &str, module_id: &str) -> Arc<SyncState> {
        if let Some(state) = self.get(branch_id, module_id) {
            return state;
        }
        let key = (branch_id.to_owned(), module_id.to_owned());
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;
        if let Some(state) = self.get(branch_id, module_id) {
            return state;
        }

        match self.storage.ensure_module_store(branch_id, module_id).await {
            Ok(store) => {
                let snapshot = store.snapshot(None);
                debug!(branch_id, module_id, version = snapshot.version, "sync state loaded");
                self.install(SyncState::from_snapshot(branch_id, module_id, snapshot))
            }
            Err(e) => {
                warn!(branch_id, module_id, error = %e, "failed to load module snapshot, using empty state");
                let snapshot = ModuleSnapshot::empty(branch_id, module_id, &self.server_id, &now_iso());
                Arc::new(SyncState::from_snapshot(branch_id, module_id, snapshot))
            }
        }
    }

    /// Validate an incoming snapshot against the insert-only policy and apply it.
    ///
    /// On any failure the cached state is left untouched.
    pub async fn apply_snapshot(
        &self,
        branch_id: &str,
        module_id: &str,
        incoming: &Value,
        context: &ApplyContext,
    ) -> Result<Arc<SyncState>, SyncError> {
        let incoming = IncomingSnapshot::parse(incoming)?;
        let key = (branch_id.to_owned(), module_id.to_owned());
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let store = self.storage.ensure_module_store(branch_id, module_id).await?;
        let current = store.snapshot(None);
        let declared = declared_tables(store.as_ref());
        let incoming_counts = incoming.tables.as_ref().map(summarize_table_counts);
        let candidate = normalize(incoming, &current, &declared, context.partial);

        if let Err(violation) =
            validate_insert_only(branch_id, module_id, &current, &candidate, &declared)
        {
            warn!(
                branch_id,
                module_id,
                reason = violation.reason.as_str(),
                table = violation.table_name.as_deref(),
                current_counts = %serde_json::Value::Object(summarize_table_counts(&current.tables)),
                incoming_counts = ?incoming_counts,
                "insert-only snapshot rejected"
            );
            return Err(violation.into());
        }

        let applied = store
            .replace_tables_from_snapshot(candidate, &context.mutation)
            .inspect_err(|e| warn!(branch_id, module_id, error = %e, "failed to replace tables"))?;
        self.storage
            .persist_module_store(store.as_ref())
            .await
            .inspect_err(|e| warn!(branch_id, module_id, error = %e, "failed to persist module"))?;

        info!(branch_id, module_id, version = applied.version, "snapshot applied");
        Ok(self.install(SyncState::from_snapshot(branch_id, module_id, applied)))
    }

    /// Apply a single row mutation, persist, and refresh the cached state.
    pub async fn apply_mutation(
        &self,
        branch_id: &str,
        module_id: &str,
        table: &str,
        action: MutationAction,
        record: &Value,
        context: &MutationContext,
    ) -> Result<(MutationOutcome, Arc<SyncState>), SyncError> {
        let key = (branch_id.to_owned(), module_id.to_owned());
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        let store = self.storage.ensure_module_store(branch_id, module_id).await?;
        let outcome = store.apply_mutation(table, action, record, context)?;
        self.storage.persist_module_store(store.as_ref()).await?;
        debug!(branch_id, module_id, table, action = %outcome.action, version = outcome.version, "mutation applied");
        let state = self.install(SyncState::from_snapshot(branch_id, module_id, store.snapshot(None)));
        Ok((outcome, state))
    }

    /// Reload the cached state from storage.
    pub async fn refresh(&self, branch_id: &str, module_id: &str) -> Result<Arc<SyncState>, SyncError> {
        let key = (branch_id.to_owned(), module_id.to_owned());
        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;
        let store = self.storage.ensure_module_store(branch_id, module_id).await?;
        Ok(self.install(SyncState::from_snapshot(branch_id, module_id, store.snapshot(None))))
    }
}

fn declared_tables(store: &dyn ModuleStore) -> Vec<TableDefinition> {
    store
        .tables()
        .into_iter()
        .map(|name| {
            store.table_definition(&name).unwrap_or(TableDefinition {
                name,
                fields: Vec::new(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ViolationReason;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use branchsync_core::errors::StorageError;
    use branchsync_core::memory::MemoryStorage;
    use branchsync_core::store::ModuleSchema;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn schema() -> ModuleSchema {
        ModuleSchema {
            module_id: "pos".into(),
            tables: vec![
                TableDefinition::keyed_by_id("order_header"),
                TableDefinition::keyed_by_id("order_line"),
            ],
        }
    }

    fn state_store() -> StateStore {
        StateStore::new(Arc::new(MemoryStorage::new(vec![schema()], "ws-test")), "ws-test")
    }

    /// Counts store loads and yields once so concurrent callers overlap.
    struct CountingStorage {
        inner: MemoryStorage,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ModuleStorage for CountingStorage {
        async fn ensure_module_store(
            &self,
            branch_id: &str,
            module_id: &str,
        ) -> Result<Arc<dyn ModuleStore>, StorageError> {
            let _ = self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.inner.ensure_module_store(branch_id, module_id).await
        }

        async fn branch_modules(
            &self,
            branch_id: &str,
        ) -> Result<Vec<Arc<dyn ModuleStore>>, StorageError> {
            self.inner.branch_modules(branch_id).await
        }

        async fn persist_module_store(&self, store: &dyn ModuleStore) -> Result<(), StorageError> {
            self.inner.persist_module_store(store).await
        }
    }

    #[tokio::test]
    async fn ensure_state_loads_and_caches() {
        let store = state_store();
        assert!(store.get("b1", "pos").is_none());
        let state = store.ensure_state("b1", "pos").await;
        assert_eq!(state.version, 1);
        assert!(state.module_snapshot.tables.contains_key("order_header"));
        assert!(store.get("b1", "pos").is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_module_falls_back_to_empty() {
        let store = state_store();
        let state = store.ensure_state("b1", "nope").await;
        assert_eq!(state.version, 1);
        assert!(state.module_snapshot.tables.is_empty());
        assert_eq!(state.module_snapshot.meta["serverId"], "ws-test");
        assert!(store.get("b1", "nope").is_none());
    }

    #[tokio::test]
    async fn concurrent_misses_load_once() {
        let storage = Arc::new(CountingStorage {
            inner: MemoryStorage::new(vec![schema()], "ws-test"),
            loads: AtomicUsize::new(0),
        });
        let store = Arc::new(StateStore::new(storage.clone(), "ws-test"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.ensure_state("b1", "pos").await })
            })
            .collect();
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().version);
        }
        assert!(versions.iter().all(|v| *v == 1));
        assert_eq!(storage.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn apply_replaces_tables_and_updates_cache() {
        let store = state_store();
        let state = store
            .apply_snapshot(
                "b1",
                "pos",
                &json!({"version": 4, "tables": {"order_header": [{"id": "o1"}], "order_line": []}}),
                &ApplyContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(state.version, 4);
        assert_eq!(state.module_snapshot.rows("order_header").len(), 1);
        assert_eq!(store.get("b1", "pos").unwrap().version, 4);
    }

    #[tokio::test]
    async fn regression_leaves_state_untouched() {
        let store = state_store();
        let full = |version: u64| json!({"version": version, "tables": {"order_header": [{"id": "a"}], "order_line": []}});
        let _ = store
            .apply_snapshot("b1", "pos", &full(5), &ApplyContext::default())
            .await
            .unwrap();
        let err = store
            .apply_snapshot("b1", "pos", &json!({"version": 3, "tables": {"order_header": [], "order_line": []}}), &ApplyContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.violation().unwrap().reason, ViolationReason::VersionRegression);
        let state = store.ensure_state("b1", "pos").await;
        assert_eq!(state.version, 5);
        assert_eq!(state.module_snapshot.rows("order_header").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_keys_rejected_without_mutation() {
        let store = state_store();
        let err = store
            .apply_snapshot(
                "b1",
                "pos",
                &json!({"tables": {"order_header": [{"id": "x"}, {"id": "x"}], "order_line": []}}),
                &ApplyContext::default(),
            )
            .await
            .unwrap_err();
        assert_matches!(&err, SyncError::InsertOnlyViolation(v) if v.key.as_deref() == Some("x"));
        let state = store.ensure_state("b1", "pos").await;
        assert!(state.module_snapshot.rows("order_header").is_empty());
    }

    #[tokio::test]
    async fn partial_apply_keeps_omitted_tables() {
        let store = state_store();
        let _ = store
            .apply_snapshot(
                "b1",
                "pos",
                &json!({"tables": {"order_header": [], "order_line": [{"id": "l1"}]}}),
                &ApplyContext::default(),
            )
            .await
            .unwrap();
        let partial = ApplyContext {
            partial: true,
            ..ApplyContext::default()
        };
        let state = store
            .apply_snapshot("b1", "pos", &json!({"tables": {"order_header": [{"id": "o9"}]}}), &partial)
            .await
            .unwrap();
        assert_eq!(state.module_snapshot.rows("order_line").len(), 1);
        assert_eq!(state.module_snapshot.rows("order_header")[0]["id"], "o9");
    }

    #[tokio::test]
    async fn strict_apply_rejects_omitted_table() {
        let store = state_store();
        let err = store
            .apply_snapshot("b1", "pos", &json!({"tables": {"order_header": []}}), &ApplyContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.violation().unwrap().reason, ViolationReason::MissingTable);
    }

    #[tokio::test]
    async fn apply_to_unknown_module_is_storage_error() {
        let store = state_store();
        let err = store
            .apply_snapshot("b1", "nope", &json!({"tables": {}}), &ApplyContext::default())
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::Storage(StorageError::ModuleNotFound { .. }));
    }

    #[tokio::test]
    async fn mutation_bumps_cached_version() {
        let store = state_store();
        let before = store.ensure_state("b1", "pos").await.version;
        let (outcome, state) = store
            .apply_mutation(
                "b1",
                "pos",
                "order_header",
                MutationAction::Insert,
                &json!({"id": "o1"}),
                &MutationContext::default(),
            )
            .await
            .unwrap();
        assert!(outcome.created);
        assert_eq!(state.version, before + 1);
        assert_eq!(store.get("b1", "pos").unwrap().version, before + 1);
    }
}
