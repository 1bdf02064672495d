//! Collaborator contracts consumed by the sync core.
//!
//! The core never touches durable storage directly. It talks to a
//! [`ModuleStorage`] that hands out one [`ModuleStore`] per
//! `(branch, module)`, records rejected mutations through an [`AuditLog`],
//! and delegates point-of-sale order persistence to an [`OrderProcessor`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{AuditError, OrderError, StorageError};
use crate::json::key_part;

/// Versioned table contents of one module for one branch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleSnapshot {
    /// Monotonic version counter.
    pub version: u64,
    /// Free-form metadata (`lastUpdatedAt`, `branchId`, `moduleId`, ...).
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Table name to row array.
    #[serde(default)]
    pub tables: Map<String, Value>,
}

impl ModuleSnapshot {
    /// The empty fallback snapshot used when storage has nothing to offer.
    pub fn empty(branch_id: &str, module_id: &str, server_id: &str, timestamp: &str) -> Self {
        let mut meta = Map::new();
        let _ = meta.insert("lastUpdatedAt".into(), Value::String(timestamp.to_owned()));
        let _ = meta.insert("branchId".into(), Value::String(branch_id.to_owned()));
        let _ = meta.insert("moduleId".into(), Value::String(module_id.to_owned()));
        let _ = meta.insert("serverId".into(), Value::String(server_id.to_owned()));
        Self {
            version: 1,
            meta,
            tables: Map::new(),
        }
    }

    /// `meta.lastUpdatedAt`, if recorded.
    pub fn last_updated_at(&self) -> Option<&str> {
        self.meta.get("lastUpdatedAt").and_then(Value::as_str)
    }

    /// Rows of a table, empty when the table is absent or malformed.
    pub fn rows(&self, table: &str) -> &[Value] {
        self.tables
            .get(table)
            .and_then(Value::as_array)
            .map_or(&[], Vec::as_slice)
    }
}

/// One declared field of a table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    /// Column name.
    pub name: String,
    /// Whether the column is part of the primary key.
    #[serde(default)]
    pub primary_key: bool,
}

impl FieldDefinition {
    /// A primary-key field.
    pub fn key(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            primary_key: true,
        }
    }

    /// A plain field.
    pub fn plain(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            primary_key: false,
        }
    }
}

/// Schema of one table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDefinition {
    /// Table name.
    pub name: String,
    /// Declared fields.
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl TableDefinition {
    /// A table keyed by a single `id` column.
    pub fn keyed_by_id(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            fields: vec![FieldDefinition::key("id")],
        }
    }

    /// Names of the primary-key fields, in declaration order.
    pub fn primary_key_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Composite key of a row (`::`-joined), or `None` if any part is missing.
    ///
    /// Tables without declared keys fall back to `id`.
    pub fn record_key(&self, row: &Value) -> Option<String> {
        let mut fields = self.primary_key_fields();
        if fields.is_empty() {
            fields.push("id");
        }
        let parts = fields
            .iter()
            .map(|field| row.get(*field).and_then(key_part))
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("::"))
    }
}

/// Schema of one module: the tables every snapshot must carry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSchema {
    /// Module identifier (`pos`, `kds`, ...).
    pub module_id: String,
    /// Declared tables.
    #[serde(default)]
    pub tables: Vec<TableDefinition>,
}

/// A table-level mutation requested by a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationAction {
    /// Add a new row.
    #[serde(rename = "module:insert")]
    Insert,
    /// Shallow-merge fields into an existing row.
    #[serde(rename = "module:merge")]
    Merge,
    /// Insert or merge depending on whether the row exists.
    #[serde(rename = "module:save")]
    Save,
    /// Remove a row.
    #[serde(rename = "module:delete")]
    Delete,
}

impl MutationAction {
    /// Wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "module:insert",
            Self::Merge => "module:merge",
            Self::Save => "module:save",
            Self::Delete => "module:delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationAction {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "module:insert" => Ok(Self::Insert),
            "module:merge" => Ok(Self::Merge),
            "module:save" => Ok(Self::Save),
            "module:delete" => Ok(Self::Delete),
            other => Err(StorageError::UnsupportedAction(other.to_owned())),
        }
    }
}

/// Who asked for a mutation and through which channel.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationContext {
    /// Originating connection.
    pub client_id: Option<String>,
    /// Acting user.
    pub user_id: Option<String>,
    /// Entry point label (`ws-client`, `ws`, ...).
    pub source: Option<String>,
    /// Client transaction id, when supplied.
    pub trans_id: Option<String>,
}

/// Result of a single row mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationOutcome {
    /// The action actually performed (`module:save` resolves to insert or merge).
    pub action: MutationAction,
    /// The row after the mutation, or the removed row for deletes.
    pub record: Option<Value>,
    /// Whether a new row was created.
    pub created: bool,
    /// Whether a row was removed.
    pub deleted: bool,
    /// Module version after the mutation.
    pub version: u64,
}

/// Tables of one module for one branch.
///
/// Implementations use interior mutability; all methods are synchronous and
/// must not block for long.
pub trait ModuleStore: Send + Sync {
    /// Owning branch.
    fn branch_id(&self) -> &str;
    /// Module identifier.
    fn module_id(&self) -> &str;
    /// Names of every table the module declares.
    fn tables(&self) -> Vec<String>;
    /// Schema of a table.
    fn table_definition(&self, table: &str) -> Option<TableDefinition>;
    /// Current snapshot, optionally localized.
    fn snapshot(&self, lang: Option<&str>) -> ModuleSnapshot;
    /// Current version.
    fn version(&self) -> u64;
    /// Replace table contents wholesale and return the applied snapshot.
    fn replace_tables_from_snapshot(
        &self,
        snapshot: ModuleSnapshot,
        context: &MutationContext,
    ) -> Result<ModuleSnapshot, StorageError>;
    /// Apply a single row mutation.
    fn apply_mutation(
        &self,
        table: &str,
        action: MutationAction,
        record: &Value,
        context: &MutationContext,
    ) -> Result<MutationOutcome, StorageError>;
    /// Rows of a table matching every field of `filter` by equality.
    fn query_table(
        &self,
        table: &str,
        filter: Option<&Map<String, Value>>,
    ) -> Result<Vec<Value>, StorageError>;
    /// A single row by primary key.
    fn get_record(&self, table: &str, id: &str) -> Result<Option<Value>, StorageError>;
}

/// Factory and persistence boundary for module stores.
#[async_trait]
pub trait ModuleStorage: Send + Sync {
    /// Store for `(branch, module)`, creating or loading it on first use.
    async fn ensure_module_store(
        &self,
        branch_id: &str,
        module_id: &str,
    ) -> Result<Arc<dyn ModuleStore>, StorageError>;

    /// Every module store that belongs in a branch snapshot.
    async fn branch_modules(&self, branch_id: &str)
    -> Result<Vec<Arc<dyn ModuleStore>>, StorageError>;

    /// Commit a store to durable storage.
    async fn persist_module_store(&self, store: &dyn ModuleStore) -> Result<(), StorageError>;
}

/// A mutation the core refused or short-circuited, kept for audit.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedMutation {
    /// Why it was rejected (`duplicate-trans-id`, `duplicate-order`, ...).
    pub reason: String,
    /// Entry point (`ws-publish`, `ws-pos-order`).
    pub source: String,
    /// Client transaction id.
    pub trans_id: Option<String>,
    /// Mutation id the client attached.
    pub mutation_id: Option<String>,
    /// Structured context.
    pub meta: Value,
    /// The offending payload.
    pub payload: Value,
}

/// Append-only record of rejected mutations.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Record a rejected mutation. Callers ignore failures beyond logging them.
    async fn log_rejected_mutation(
        &self,
        branch_id: &str,
        module_id: &str,
        record: RejectedMutation,
    ) -> Result<(), AuditError>;
}

/// Result of persisting an order.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderOutcome {
    /// The persisted order as stored.
    pub order: Value,
    /// Whether the order already existed.
    pub existing: bool,
}

/// Point-of-sale order persistence.
#[async_trait]
pub trait OrderProcessor: Send + Sync {
    /// Persist an order carried by a `create-order` publish.
    async fn process_order(
        &self,
        branch_id: &str,
        module_id: &str,
        order: &Value,
        context: &MutationContext,
    ) -> Result<OrderOutcome, OrderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn empty_snapshot_defaults() {
        let snap = ModuleSnapshot::empty("b1", "pos", "ws-1", "2026-01-01T00:00:00.000Z");
        assert_eq!(snap.version, 1);
        assert!(snap.tables.is_empty());
        assert_eq!(snap.meta["branchId"], "b1");
        assert_eq!(snap.meta["serverId"], "ws-1");
        assert_eq!(snap.last_updated_at(), Some("2026-01-01T00:00:00.000Z"));
    }

    #[test]
    fn rows_of_missing_table_is_empty() {
        let snap = ModuleSnapshot::default();
        assert!(snap.rows("order_header").is_empty());
    }

    #[test]
    fn snapshot_deserializes_without_meta() {
        let snap: ModuleSnapshot =
            serde_json::from_value(json!({"version": 4, "tables": {"t": [{"id": 1}]}})).unwrap();
        assert_eq!(snap.version, 4);
        assert_eq!(snap.rows("t").len(), 1);
        assert!(snap.meta.is_empty());
    }

    #[test]
    fn composite_record_key() {
        let table = TableDefinition {
            name: "order_line".into(),
            fields: vec![
                FieldDefinition::key("orderId"),
                FieldDefinition::key("lineNo"),
                FieldDefinition::plain("qty"),
            ],
        };
        assert_eq!(table.primary_key_fields(), vec!["orderId", "lineNo"]);
        assert_eq!(
            table.record_key(&json!({"orderId": "o1", "lineNo": 2})).as_deref(),
            Some("o1::2")
        );
        assert_eq!(table.record_key(&json!({"orderId": "o1"})), None);
    }

    #[test]
    fn keyless_table_falls_back_to_id() {
        let table = TableDefinition {
            name: "notes".into(),
            fields: vec![],
        };
        assert_eq!(table.record_key(&json!({"id": "n1"})).as_deref(), Some("n1"));
    }

    #[test]
    fn mutation_action_parses_wire_names() {
        assert_eq!("module:merge".parse::<MutationAction>().unwrap(), MutationAction::Merge);
        assert_eq!(MutationAction::Delete.as_str(), "module:delete");
        assert_matches!(
            "module:nope".parse::<MutationAction>(),
            Err(StorageError::UnsupportedAction(a)) if a == "module:nope"
        );
    }

    #[test]
    fn schema_uses_camel_case() {
        let schema: ModuleSchema = serde_json::from_value(json!({
            "moduleId": "pos",
            "tables": [{"name": "order_header", "fields": [{"name": "id", "primaryKey": true}]}]
        }))
        .unwrap();
        assert_eq!(schema.module_id, "pos");
        assert_eq!(schema.tables[0].primary_key_fields(), vec!["id"]);
    }

    #[test]
    fn rejected_mutation_serializes_camel_case() {
        let record = RejectedMutation {
            reason: "duplicate-trans-id".into(),
            source: "ws-publish".into(),
            trans_id: Some("t1".into()),
            mutation_id: None,
            meta: json!({}),
            payload: json!({}),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["transId"], "t1");
        assert!(value["mutationId"].is_null());
    }
}
