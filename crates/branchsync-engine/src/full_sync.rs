//! Full-sync directive flags.
//!
//! A flag tells every client of a branch that incremental deltas for a module
//! (or for every module, `*`) cannot be trusted and a full snapshot must be
//! re-pulled. Disabled flags stay in the registry as tombstones.

use std::collections::HashMap;

use branchsync_core::json::now_iso;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value, json};

/// Branch used when a toggle names none.
pub const DEFAULT_FLAG_BRANCH: &str = "default";
/// Module wildcard matching every module of a branch.
pub const WILDCARD_MODULE: &str = "*";

/// One full-sync flag.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncFlag {
    /// Branch the flag applies to.
    pub branch_id: String,
    /// Module, or `*`.
    pub module_id: String,
    /// Whether clients must currently full-sync.
    pub enabled: bool,
    /// Operator-supplied reason.
    pub reason: Option<String>,
    /// Who enabled the flag.
    pub requested_by: Option<String>,
    /// Last toggle time.
    pub updated_at: String,
    /// Free-form metadata.
    pub meta: Map<String, Value>,
    /// Who disabled the flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleared_by: Option<String>,
}

impl FullSyncFlag {
    /// Wire form embedded in payloads (never carries `clearedBy`).
    pub fn serialize(&self) -> Value {
        json!({
            "branchId": self.branch_id,
            "moduleId": self.module_id,
            "enabled": self.enabled,
            "reason": self.reason,
            "requestedBy": self.requested_by,
            "updatedAt": self.updated_at,
            "meta": self.meta,
        })
    }

    /// The `server:directive` frame announcing this flag.
    pub fn directive_frame(&self) -> Value {
        let mut frame = json!({
            "type": "server:directive",
            "directive": "full-sync-flag",
            "branchId": self.branch_id,
            "moduleId": self.module_id,
            "enabled": self.enabled,
            "reason": self.reason,
            "requestedBy": self.requested_by,
            "updatedAt": self.updated_at,
            "meta": self.meta,
        });
        if let (Some(cleared_by), Some(obj)) = (&self.cleared_by, frame.as_object_mut()) {
            let _ = obj.insert("clearedBy".into(), Value::String(cleared_by.clone()));
        }
        frame
    }
}

/// Options of a flag toggle.
#[derive(Clone, Debug, Default)]
pub struct FlagOptions {
    /// Reason; keeps the previous one when omitted.
    pub reason: Option<String>,
    /// Requester; keeps the previous one when omitted.
    pub requested_by: Option<String>,
    /// Explicit clearer for disables.
    pub cleared_by: Option<String>,
    /// Metadata merged over the previous meta.
    pub meta: Option<Map<String, Value>>,
}

/// Filter for [`FullSyncRegistry::list_active`].
#[derive(Clone, Debug, Default)]
pub struct FlagFilter {
    /// Only flags of this branch.
    pub branch_id: Option<String>,
    /// Only flags naming exactly this module.
    pub module_id: Option<String>,
}

fn scope(branch_id: &str, module_id: &str) -> (String, String) {
    let branch = match branch_id.trim() {
        "" => DEFAULT_FLAG_BRANCH,
        b => b,
    };
    let module = match module_id.trim() {
        "" => WILDCARD_MODULE,
        m => m,
    };
    (branch.to_owned(), module.to_owned())
}

/// Registry of full-sync flags keyed by `(branch, module-or-*)`.
#[derive(Default)]
pub struct FullSyncRegistry {
    flags: RwLock<HashMap<(String, String), FullSyncFlag>>,
}

impl FullSyncRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert an enabled flag.
    pub fn enable(&self, branch_id: &str, module_id: &str, options: FlagOptions) -> FullSyncFlag {
        let key = scope(branch_id, module_id);
        let mut flags = self.flags.write();
        let previous = flags.get(&key);
        let mut meta = previous.map(|p| p.meta.clone()).unwrap_or_default();
        if let Some(extra) = options.meta {
            meta.extend(extra);
        }
        let flag = FullSyncFlag {
            branch_id: key.0.clone(),
            module_id: key.1.clone(),
            enabled: true,
            reason: options.reason.or_else(|| previous.and_then(|p| p.reason.clone())),
            requested_by: options
                .requested_by
                .or_else(|| previous.and_then(|p| p.requested_by.clone())),
            updated_at: now_iso(),
            meta,
            cleared_by: previous.and_then(|p| p.cleared_by.clone()),
        };
        let _ = flags.insert(key, flag.clone());
        flag
    }

    /// Tombstone an existing flag. No-op returning `None` when absent.
    pub fn disable(
        &self,
        branch_id: &str,
        module_id: &str,
        options: FlagOptions,
    ) -> Option<FullSyncFlag> {
        let key = scope(branch_id, module_id);
        let mut flags = self.flags.write();
        let flag = flags.get_mut(&key)?;
        flag.enabled = false;
        flag.updated_at = now_iso();
        let previous = flag.cleared_by.take();
        flag.cleared_by = options.requested_by.or(options.cleared_by).or(previous);
        Some(flag.clone())
    }

    /// Whether the exact `(branch, module)` flag is enabled.
    pub fn is_active(&self, branch_id: &str, module_id: &str) -> bool {
        self.flags
            .read()
            .get(&scope(branch_id, module_id))
            .is_some_and(|f| f.enabled)
    }

    /// Enabled flags matching the filter, ordered by branch then module.
    pub fn list_active(&self, filter: &FlagFilter) -> Vec<FullSyncFlag> {
        let mut active: Vec<_> = self
            .flags
            .read()
            .values()
            .filter(|f| f.enabled)
            .filter(|f| filter.branch_id.as_ref().is_none_or(|b| &f.branch_id == b))
            .filter(|f| filter.module_id.as_ref().is_none_or(|m| &f.module_id == m))
            .cloned()
            .collect();
        active.sort_by(|a, b| (&a.branch_id, &a.module_id).cmp(&(&b.branch_id, &b.module_id)));
        active
    }

    /// Enabled flags of a branch that name `module_id` or the wildcard.
    pub fn active_for(&self, branch_id: &str, module_id: &str) -> Vec<FullSyncFlag> {
        let mut active = self.list_active(&FlagFilter {
            branch_id: Some(branch_id.to_owned()),
            module_id: None,
        });
        active.retain(|f| f.module_id == module_id || f.module_id == WILDCARD_MODULE);
        active
    }

    /// Every enabled flag of a branch, serialized.
    pub fn serialized_for_branch(&self, branch_id: &str) -> Vec<Value> {
        self.list_active(&FlagFilter {
            branch_id: Some(branch_id.to_owned()),
            module_id: None,
        })
        .iter()
        .map(FullSyncFlag::serialize)
        .collect()
    }
}
