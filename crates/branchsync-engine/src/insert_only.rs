//! Insert-only consistency gate for externally supplied snapshots.
//!
//! An incoming snapshot may replace whole tables but may never regress the
//! module version, omit a declared table, or carry rows whose primary keys
//! are missing or collide.

use std::collections::HashSet;

use branchsync_core::store::{ModuleSnapshot, TableDefinition};
use serde_json::{Map, Value};

use crate::errors::{SyncError, Violation, ViolationReason};

/// A client-supplied snapshot before normalization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IncomingSnapshot {
    /// Requested version, if supplied.
    pub version: Option<u64>,
    /// Table contents, if supplied.
    pub tables: Option<Map<String, Value>>,
    /// Metadata to merge over the current meta.
    pub meta: Map<String, Value>,
}

impl IncomingSnapshot {
    /// Parse leniently: versions may be numbers or numeric strings.
    pub fn parse(value: &Value) -> Result<Self, SyncError> {
        let Some(fields) = value.as_object() else {
            return Err(SyncError::InvalidSnapshot("snapshot must be an object".into()));
        };
        let version = fields.get("version").and_then(parse_version);
        let tables = match fields.get("tables") {
            None | Some(Value::Null) => None,
            Some(Value::Object(tables)) => Some(tables.clone()),
            Some(_) => {
                return Err(SyncError::InvalidSnapshot("tables must be an object".into()));
            }
        };
        let meta = fields
            .get("meta")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            version,
            tables,
            meta,
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_version(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.trunc() as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Build the candidate snapshot that validation runs against.
///
/// With `partial` intent, absent tables are copied from `current` (all of them
/// when the incoming snapshot has no `tables` at all) and meta is merged over
/// the current meta. Without it, the incoming tables are taken as-is.
pub fn normalize(
    incoming: IncomingSnapshot,
    current: &ModuleSnapshot,
    declared: &[TableDefinition],
    partial: bool,
) -> ModuleSnapshot {
    let version = incoming.version.unwrap_or(current.version);
    let mut tables = incoming.tables.unwrap_or_default();
    if partial {
        for table in declared {
            if !tables.contains_key(&table.name) {
                let rows = current
                    .tables
                    .get(&table.name)
                    .cloned()
                    .unwrap_or_else(|| Value::Array(Vec::new()));
                let _ = tables.insert(table.name.clone(), rows);
            }
        }
    }
    let mut meta = current.meta.clone();
    for (key, value) in incoming.meta {
        let _ = meta.insert(key, value);
    }
    ModuleSnapshot {
        version,
        meta,
        tables,
    }
}

/// Check a candidate snapshot against the insert-only policy.
pub fn validate_insert_only(
    branch_id: &str,
    module_id: &str,
    current: &ModuleSnapshot,
    candidate: &ModuleSnapshot,
    declared: &[TableDefinition],
) -> Result<(), Violation> {
    if candidate.version < current.version {
        let mut v = Violation::new(ViolationReason::VersionRegression, branch_id, module_id);
        v.current_version = Some(current.version);
        v.incoming_version = Some(candidate.version);
        return Err(v);
    }

    for definition in declared {
        let name = definition.name.as_str();
        let Some(rows) = candidate.tables.get(name) else {
            let mut v =
                Violation::new(ViolationReason::MissingTable, branch_id, module_id).table(name);
            v.current_count = Some(current.rows(name).len());
            return Err(v);
        };
        let Some(rows) = rows.as_array() else {
            return Err(
                Violation::new(ViolationReason::InvalidTableFormat, branch_id, module_id)
                    .table(name),
            );
        };
        check_primary_keys(branch_id, module_id, definition, rows)?;
    }
    Ok(())
}

fn check_primary_keys(
    branch_id: &str,
    module_id: &str,
    definition: &TableDefinition,
    rows: &[Value],
) -> Result<(), Violation> {
    if definition.primary_key_fields().is_empty() {
        return Ok(());
    }
    let mut seen = HashSet::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        if !row.is_object() {
            continue;
        }
        let Some(key) = definition.record_key(row) else {
            let mut v = Violation::new(ViolationReason::MissingPrimaryKey, branch_id, module_id)
                .table(&definition.name);
            v.index = Some(index);
            return Err(v);
        };
        if !seen.insert(key.clone()) {
            let mut v =
                Violation::new(ViolationReason::DuplicatePrimaryKey, branch_id, module_id)
                    .table(&definition.name);
            v.key = Some(key);
            return Err(v);
        }
    }
    Ok(())
}

/// Row count per table, for rejection logs.
pub fn summarize_table_counts(tables: &Map<String, Value>) -> Map<String, Value> {
    tables
        .iter()
        .map(|(name, rows)| {
            let count = rows.as_array().map_or(0, Vec::len);
            (name.clone(), Value::from(count))
        })
        .collect()
}
