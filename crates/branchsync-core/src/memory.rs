//! In-memory module storage with an optional JSON mirror on disk.
//!
//! Each `(branch, module)` gets a [`MemoryModuleStore`] built from the module
//! schema. When a data directory is configured, stores are seeded from
//! `{data_dir}/{branch}/{module}.json` on first access and written back on
//! every [`ModuleStorage::persist_module_store`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::StorageError;
use crate::json::{merge_into, now_iso};
use crate::store::{
    ModuleSchema, ModuleSnapshot, ModuleStorage, ModuleStore, MutationAction, MutationContext,
    MutationOutcome, TableDefinition,
};

/// Module storage backed by process memory.
pub struct MemoryStorage {
    schemas: Vec<ModuleSchema>,
    data_dir: Option<PathBuf>,
    server_id: String,
    stores: Mutex<HashMap<(String, String), Arc<MemoryModuleStore>>>,
}

impl MemoryStorage {
    /// Create a storage serving the given module schemas.
    pub fn new(schemas: Vec<ModuleSchema>, server_id: impl Into<String>) -> Self {
        Self {
            schemas,
            data_dir: None,
            server_id: server_id.into(),
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Mirror stores to JSON files under `dir`.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Declared module schemas.
    pub fn schemas(&self) -> &[ModuleSchema] {
        &self.schemas
    }

    fn schema(&self, module_id: &str) -> Option<&ModuleSchema> {
        self.schemas.iter().find(|s| s.module_id == module_id)
    }

    fn snapshot_path(dir: &Path, branch_id: &str, module_id: &str) -> PathBuf {
        dir.join(sanitize_segment(branch_id))
            .join(format!("{}.json", sanitize_segment(module_id)))
    }

    async fn load_initial(&self, branch_id: &str, module_id: &str) -> Result<ModuleSnapshot, StorageError> {
        let empty = || ModuleSnapshot::empty(branch_id, module_id, &self.server_id, &now_iso());
        let Some(dir) = &self.data_dir else {
            return Ok(empty());
        };
        let path = Self::snapshot_path(dir, branch_id, module_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                debug!(path = %path.display(), "loading module snapshot from disk");
                Ok(serde_json::from_str(&content)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(empty()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ModuleStorage for MemoryStorage {
    async fn ensure_module_store(
        &self,
        branch_id: &str,
        module_id: &str,
    ) -> Result<Arc<dyn ModuleStore>, StorageError> {
        let key = (branch_id.to_owned(), module_id.to_owned());
        let mut stores = self.stores.lock().await;
        if let Some(store) = stores.get(&key) {
            return Ok(store.clone());
        }
        let schema = self
            .schema(module_id)
            .cloned()
            .ok_or_else(|| StorageError::ModuleNotFound {
                branch_id: branch_id.to_owned(),
                module_id: module_id.to_owned(),
            })?;
        let initial = self.load_initial(branch_id, module_id).await?;
        let store = Arc::new(MemoryModuleStore::new(branch_id, schema, initial));
        info!(branch_id, module_id, version = store.version(), "module store ready");
        let _ = stores.insert(key, store.clone());
        Ok(store)
    }

    async fn branch_modules(
        &self,
        branch_id: &str,
    ) -> Result<Vec<Arc<dyn ModuleStore>>, StorageError> {
        let mut modules = Vec::with_capacity(self.schemas.len());
        for schema in &self.schemas {
            modules.push(self.ensure_module_store(branch_id, &schema.module_id).await?);
        }
        Ok(modules)
    }

    async fn persist_module_store(&self, store: &dyn ModuleStore) -> Result<(), StorageError> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let path = Self::snapshot_path(dir, store.branch_id(), store.module_id());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&store.snapshot(None))?;
        tokio::fs::write(&path, json).await?;
        debug!(path = %path.display(), "module snapshot persisted");
        Ok(())
    }
}

fn sanitize_segment(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Tables of one module held in memory.
pub struct MemoryModuleStore {
    branch_id: String,
    schema: ModuleSchema,
    data: RwLock<ModuleSnapshot>,
}

impl MemoryModuleStore {
    /// Build a store from its schema and initial contents.
    pub fn new(branch_id: &str, schema: ModuleSchema, mut initial: ModuleSnapshot) -> Self {
        for table in &schema.tables {
            let entry = initial
                .tables
                .entry(table.name.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }
        }
        Self {
            branch_id: branch_id.to_owned(),
            schema,
            data: RwLock::new(initial),
        }
    }

    fn definition(&self, table: &str) -> Result<&TableDefinition, StorageError> {
        self.schema
            .tables
            .iter()
            .find(|t| t.name == table)
            .ok_or_else(|| StorageError::TableNotFound(table.to_owned()))
    }
}

impl ModuleStore for MemoryModuleStore {
    fn branch_id(&self) -> &str {
        &self.branch_id
    }

    fn module_id(&self) -> &str {
        &self.schema.module_id
    }

    fn tables(&self) -> Vec<String> {
        self.schema.tables.iter().map(|t| t.name.clone()).collect()
    }

    fn table_definition(&self, table: &str) -> Option<TableDefinition> {
        self.definition(table).ok().cloned()
    }

    fn snapshot(&self, lang: Option<&str>) -> ModuleSnapshot {
        let mut snapshot = self.data.read().clone();
        if let Some(lang) = lang {
            let _ = snapshot.meta.insert("lang".into(), Value::String(lang.to_owned()));
        }
        snapshot
    }

    fn version(&self) -> u64 {
        self.data.read().version
    }

    fn replace_tables_from_snapshot(
        &self,
        snapshot: ModuleSnapshot,
        context: &MutationContext,
    ) -> Result<ModuleSnapshot, StorageError> {
        if let Some((name, _)) = snapshot.tables.iter().find(|(_, rows)| !rows.is_array()) {
            return Err(StorageError::InvalidRecord(format!("table {name} must be an array")));
        }
        let mut data = self.data.write();
        let mut meta = data.meta.clone();
        merge_into(&mut meta, &snapshot.meta);
        let _ = meta.insert("lastUpdatedAt".into(), Value::String(now_iso()));
        if let Some(source) = &context.source {
            let _ = meta.insert("lastSource".into(), Value::String(source.clone()));
        }
        let mut tables = snapshot.tables;
        for table in &self.schema.tables {
            let _ = tables
                .entry(table.name.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
        }
        *data = ModuleSnapshot {
            version: snapshot.version.max(data.version),
            meta,
            tables,
        };
        Ok(data.clone())
    }

    fn apply_mutation(
        &self,
        table: &str,
        action: MutationAction,
        record: &Value,
        _context: &MutationContext,
    ) -> Result<MutationOutcome, StorageError> {
        let definition = self.definition(table)?;
        if !record.is_object() {
            return Err(StorageError::InvalidRecord("record must be an object".into()));
        }
        let mut data = self.data.write();
        let mut rows = match data.tables.remove(table) {
            Some(Value::Array(rows)) => rows,
            _ => Vec::new(),
        };
        let result = mutate_rows(&mut rows, definition, action, record);
        let _ = data.tables.insert(table.to_owned(), Value::Array(rows));
        let (effective, row, created, deleted) = result?;
        data.version += 1;
        let _ = data
            .meta
            .insert("lastUpdatedAt".into(), Value::String(now_iso()));
        Ok(MutationOutcome {
            action: effective,
            record: Some(row),
            created,
            deleted,
            version: data.version,
        })
    }

    fn query_table(
        &self,
        table: &str,
        filter: Option<&Map<String, Value>>,
    ) -> Result<Vec<Value>, StorageError> {
        let _ = self.definition(table)?;
        let data = self.data.read();
        let rows = data.rows(table).iter().filter(|row| {
            filter.is_none_or(|f| f.iter().all(|(key, want)| row.get(key) == Some(want)))
        });
        Ok(rows.cloned().collect())
    }

    fn get_record(&self, table: &str, id: &str) -> Result<Option<Value>, StorageError> {
        let definition = self.definition(table)?;
        let data = self.data.read();
        Ok(data
            .rows(table)
            .iter()
            .find(|row| definition.record_key(row).as_deref() == Some(id))
            .cloned())
    }
}

type RowChange = (MutationAction, Value, bool, bool);

fn mutate_rows(
    rows: &mut Vec<Value>,
    definition: &TableDefinition,
    action: MutationAction,
    record: &Value,
) -> Result<RowChange, StorageError> {
    let position = |rows: &[Value], key: &str| row_position(rows, definition, key);
    match action {
        MutationAction::Insert => insert_row(rows, definition, record),
        MutationAction::Save => {
            let existing = definition
                .record_key(record)
                .and_then(|key| position(rows.as_slice(), &key));
            match existing {
                Some(idx) => Ok((MutationAction::Merge, merge_row(&mut rows[idx], record), false, false)),
                None => insert_row(rows, definition, record),
            }
        }
        MutationAction::Merge => {
            let key = required_key(definition, record)?;
            let idx = position(rows.as_slice(), &key).ok_or_else(|| StorageError::RecordNotFound {
                table: definition.name.clone(),
                key,
            })?;
            Ok((MutationAction::Merge, merge_row(&mut rows[idx], record), false, false))
        }
        MutationAction::Delete => {
            let key = required_key(definition, record)?;
            let idx = position(rows.as_slice(), &key).ok_or_else(|| StorageError::RecordNotFound {
                table: definition.name.clone(),
                key,
            })?;
            Ok((MutationAction::Delete, rows.remove(idx), false, true))
        }
    }
}

fn row_position(rows: &[Value], definition: &TableDefinition, key: &str) -> Option<usize> {
    rows.iter()
        .position(|row| definition.record_key(row).as_deref() == Some(key))
}

fn insert_row(
    rows: &mut Vec<Value>,
    definition: &TableDefinition,
    record: &Value,
) -> Result<RowChange, StorageError> {
    let mut row = record.clone();
    let keys = definition.primary_key_fields();
    let id_keyed = keys.is_empty() || keys == ["id"];
    if id_keyed && row.get("id").is_none_or(Value::is_null) {
        if let Some(obj) = row.as_object_mut() {
            let _ = obj.insert("id".into(), Value::String(Uuid::now_v7().to_string()));
        }
    }
    let key = required_key(definition, &row)?;
    if row_position(rows, definition, &key).is_some() {
        return Err(StorageError::DuplicateRecord {
            table: definition.name.clone(),
            key,
        });
    }
    rows.push(row.clone());
    Ok((MutationAction::Insert, row, true, false))
}

fn merge_row(target: &mut Value, patch: &Value) -> Value {
    if let (Some(dst), Some(src)) = (target.as_object_mut(), patch.as_object()) {
        merge_into(dst, src);
    }
    target.clone()
}

fn required_key(definition: &TableDefinition, record: &Value) -> Result<String, StorageError> {
    definition.record_key(record).ok_or_else(|| {
        StorageError::InvalidRecord(format!("missing primary key for {}", definition.name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn pos_schema() -> ModuleSchema {
        ModuleSchema {
            module_id: "pos".into(),
            tables: vec![
                TableDefinition::keyed_by_id("order_header"),
                TableDefinition::keyed_by_id("pos_shift"),
            ],
        }
    }

    fn store() -> MemoryModuleStore {
        MemoryModuleStore::new("b1", pos_schema(), ModuleSnapshot::default())
    }

    fn ctx() -> MutationContext {
        MutationContext::default()
    }

    #[test]
    fn declared_tables_exist_from_start() {
        let store = store();
        let snap = store.snapshot(None);
        assert_eq!(snap.tables["order_header"], json!([]));
        assert_eq!(snap.tables["pos_shift"], json!([]));
    }

    #[test]
    fn insert_assigns_id_and_bumps_version() {
        let store = store();
        let out = store
            .apply_mutation("order_header", MutationAction::Insert, &json!({"total": 5}), &ctx())
            .unwrap();
        assert!(out.created);
        assert_eq!(out.version, 1);
        assert!(out.record.unwrap()["id"].is_string());
    }

    #[test]
    fn insert_duplicate_is_rejected() {
        let store = store();
        let row = json!({"id": "o1"});
        let _ = store
            .apply_mutation("order_header", MutationAction::Insert, &row, &ctx())
            .unwrap();
        let err = store
            .apply_mutation("order_header", MutationAction::Insert, &row, &ctx())
            .unwrap_err();
        assert_matches!(err, StorageError::DuplicateRecord { .. });
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn save_resolves_to_insert_then_merge() {
        let store = store();
        let first = store
            .apply_mutation("order_header", MutationAction::Save, &json!({"id": "o1", "a": 1}), &ctx())
            .unwrap();
        assert_eq!(first.action, MutationAction::Insert);
        let second = store
            .apply_mutation("order_header", MutationAction::Save, &json!({"id": "o1", "b": 2}), &ctx())
            .unwrap();
        assert_eq!(second.action, MutationAction::Merge);
        assert_eq!(second.record.unwrap(), json!({"id": "o1", "a": 1, "b": 2}));
    }

    #[test]
    fn merge_missing_row_fails() {
        let store = store();
        let err = store
            .apply_mutation("order_header", MutationAction::Merge, &json!({"id": "nope"}), &ctx())
            .unwrap_err();
        assert_matches!(err, StorageError::RecordNotFound { .. });
    }

    #[test]
    fn delete_removes_row() {
        let store = store();
        let _ = store
            .apply_mutation("pos_shift", MutationAction::Insert, &json!({"id": "s1"}), &ctx())
            .unwrap();
        let out = store
            .apply_mutation("pos_shift", MutationAction::Delete, &json!({"id": "s1"}), &ctx())
            .unwrap();
        assert!(out.deleted);
        assert_eq!(out.record.unwrap()["id"], "s1");
        assert!(store.query_table("pos_shift", None).unwrap().is_empty());
    }

    #[test]
    fn unknown_table_is_reported() {
        let store = store();
        let err = store
            .apply_mutation("nope", MutationAction::Insert, &json!({}), &ctx())
            .unwrap_err();
        assert_matches!(err, StorageError::TableNotFound(t) if t == "nope");
    }

    #[test]
    fn query_filters_by_equality() {
        let store = store();
        for (id, status) in [("o1", "open"), ("o2", "closed"), ("o3", "open")] {
            let _ = store
                .apply_mutation(
                    "order_header",
                    MutationAction::Insert,
                    &json!({"id": id, "status": status}),
                    &ctx(),
                )
                .unwrap();
        }
        let filter = json!({"status": "open"});
        let rows = store
            .query_table("order_header", filter.as_object())
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(store.get_record("order_header", "o2").unwrap().unwrap()["status"], "closed");
        assert!(store.get_record("order_header", "o9").unwrap().is_none());
    }

    #[test]
    fn replace_tables_keeps_highest_version() {
        let store = store();
        let snap = ModuleSnapshot {
            version: 7,
            meta: Map::new(),
            tables: json!({"order_header": [{"id": "o1"}]})
                .as_object()
                .cloned()
                .unwrap(),
        };
        let applied = store.replace_tables_from_snapshot(snap, &ctx()).unwrap();
        assert_eq!(applied.version, 7);
        assert_eq!(applied.rows("order_header").len(), 1);
        assert_eq!(applied.tables["pos_shift"], json!([]));
        assert!(applied.last_updated_at().is_some());
    }

    #[test]
    fn replace_tables_rejects_non_array() {
        let store = store();
        let snap = ModuleSnapshot {
            version: 2,
            meta: Map::new(),
            tables: json!({"order_header": {"id": "o1"}}).as_object().cloned().unwrap(),
        };
        let err = store.replace_tables_from_snapshot(snap, &ctx()).unwrap_err();
        assert_matches!(err, StorageError::InvalidRecord(_));
    }

    #[test]
    fn snapshot_carries_lang() {
        let store = store();
        assert_eq!(store.snapshot(Some("ar")).meta["lang"], "ar");
        assert!(store.snapshot(None).meta.get("lang").is_none());
    }

    #[tokio::test]
    async fn storage_rejects_unknown_module() {
        let storage = MemoryStorage::new(vec![pos_schema()], "ws-test");
        let err = storage.ensure_module_store("b1", "hr").await.err().unwrap();
        assert_matches!(err, StorageError::ModuleNotFound { .. });
    }

    #[tokio::test]
    async fn storage_reuses_store_instance() {
        let storage = MemoryStorage::new(vec![pos_schema()], "ws-test");
        let a = storage.ensure_module_store("b1", "pos").await.unwrap();
        let _ = a
            .apply_mutation("order_header", MutationAction::Insert, &json!({"id": "o1"}), &ctx())
            .unwrap();
        let b = storage.ensure_module_store("b1", "pos").await.unwrap();
        assert_eq!(b.version(), 2);
        assert_eq!(storage.branch_modules("b1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persisted_snapshot_reloads() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage =
                MemoryStorage::new(vec![pos_schema()], "ws-test").with_data_dir(dir.path());
            let store = storage.ensure_module_store("lab:test-pad", "pos").await.unwrap();
            let _ = store
                .apply_mutation("order_header", MutationAction::Insert, &json!({"id": "o1"}), &ctx())
                .unwrap();
            storage.persist_module_store(store.as_ref()).await.unwrap();
        }
        assert!(dir.path().join("lab_test-pad").join("pos.json").exists());

        let storage = MemoryStorage::new(vec![pos_schema()], "ws-test").with_data_dir(dir.path());
        let store = storage.ensure_module_store("lab:test-pad", "pos").await.unwrap();
        assert_eq!(store.version(), 2);
        assert!(store.get_record("order_header", "o1").unwrap().is_some());
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_segment("lab:test pad"), "lab_test_pad");
    }
}
