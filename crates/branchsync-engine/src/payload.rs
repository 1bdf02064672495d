//! Sync topic payloads.

use std::sync::Arc;

use serde_json::{Map, Value, json};

use crate::full_sync::{FullSyncFlag, FullSyncRegistry};
use crate::state::SyncState;

/// Caller-supplied parts of a sync payload.
#[derive(Clone, Debug, Default)]
pub struct PublishOverrides {
    /// Action label; falls back to the frame's, then `snapshot`.
    pub action: Option<String>,
    /// Mutation id; falls back to the frame's.
    pub mutation_id: Option<Value>,
    /// Meta merged last.
    pub meta: Option<Map<String, Value>>,
    /// Snapshot replacing the state's.
    pub snapshot: Option<Value>,
    /// Version replacing the state's.
    pub version: Option<u64>,
    /// Timestamp replacing the state's.
    pub updated_at: Option<String>,
    /// Originating publish frame; its extra fields are copied onto the payload.
    pub frame_data: Option<Value>,
}

impl PublishOverrides {
    /// Overrides carrying only meta.
    pub fn with_meta(meta: Value) -> Self {
        Self {
            meta: meta.as_object().cloned(),
            ..Self::default()
        }
    }
}

const RESERVED_FRAME_KEYS: [&str; 5] = ["action", "snapshot", "version", "mutationId", "meta"];

fn non_empty(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Bool(b) => *b,
        _ => true,
    })
}

/// Builds the payload published on `sync:{branch}:{module}` topics.
pub struct SyncPayloadBuilder {
    flags: Arc<FullSyncRegistry>,
    server_id: String,
}

impl SyncPayloadBuilder {
    /// Create a builder annotating payloads from `flags`.
    pub fn new(flags: Arc<FullSyncRegistry>, server_id: impl Into<String>) -> Self {
        Self {
            flags,
            server_id: server_id.into(),
        }
    }

    /// Server id stamped into payload meta.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Assemble the sync payload for `state`.
    pub fn build(&self, state: &SyncState, overrides: &PublishOverrides) -> Value {
        let frame = overrides
            .frame_data
            .as_ref()
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let snapshot = overrides.snapshot.clone().unwrap_or_else(|| {
            serde_json::to_value(&state.module_snapshot).unwrap_or(Value::Null)
        });
        let version = overrides.version.unwrap_or(state.version).max(1);

        let mut meta = Map::new();
        let _ = meta.insert("branchId".into(), json!(state.branch_id));
        let _ = meta.insert("moduleId".into(), json!(state.module_id));
        let _ = meta.insert("serverId".into(), json!(self.server_id));
        let _ = meta.insert("version".into(), json!(version));
        let _ = meta.insert(
            "updatedAt".into(),
            json!(overrides.updated_at.as_deref().unwrap_or(&state.updated_at)),
        );
        if let Some(frame_meta) = frame.get("meta").and_then(Value::as_object) {
            meta.extend(frame_meta.clone());
        }
        if let Some(extra) = &overrides.meta {
            meta.extend(extra.clone());
        }
        let active = self.flags.active_for(&state.branch_id, &state.module_id);
        if !active.is_empty() {
            let _ = meta.insert("fullSyncRequired".into(), Value::Bool(true));
            let _ = meta.insert(
                "fullSyncFlags".into(),
                Value::Array(active.iter().map(FullSyncFlag::serialize).collect()),
            );
        }

        let action = overrides
            .action
            .as_deref()
            .filter(|a| !a.is_empty())
            .map(Value::from)
            .or_else(|| non_empty(frame.get("action")).cloned())
            .unwrap_or_else(|| json!("snapshot"));
        let mutation_id = non_empty(overrides.mutation_id.as_ref())
            .or_else(|| non_empty(frame.get("mutationId")))
            .cloned()
            .unwrap_or(Value::Null);

        let mut payload = Map::new();
        let _ = payload.insert("action".into(), action);
        let _ = payload.insert("branchId".into(), json!(state.branch_id));
        let _ = payload.insert("moduleId".into(), json!(state.module_id));
        let _ = payload.insert("version".into(), json!(version));
        let _ = payload.insert("snapshot".into(), snapshot);
        let _ = payload.insert("mutationId".into(), mutation_id);
        let _ = payload.insert("meta".into(), Value::Object(meta));
        for (key, value) in frame {
            if !RESERVED_FRAME_KEYS.contains(&key.as_str()) {
                let _ = payload.insert(key, value);
            }
        }
        Value::Object(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::full_sync::FlagOptions;
    use branchsync_core::store::ModuleSnapshot;

    fn state() -> SyncState {
        SyncState {
            branch_id: "b1".into(),
            module_id: "pos".into(),
            version: 3,
            module_snapshot: ModuleSnapshot {
                version: 3,
                ..ModuleSnapshot::default()
            },
            updated_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    fn builder() -> (SyncPayloadBuilder, Arc<FullSyncRegistry>) {
        let flags = Arc::new(FullSyncRegistry::new());
        (SyncPayloadBuilder::new(flags.clone(), "ws-test"), flags)
    }

    #[test]
    fn defaults_from_state() {
        let (builder, _) = builder();
        let payload = builder.build(&state(), &PublishOverrides::default());
        assert_eq!(payload["action"], "snapshot");
        assert_eq!(payload["version"], 3);
        assert!(payload["mutationId"].is_null());
        assert_eq!(payload["snapshot"]["version"], 3);
        assert_eq!(
            payload["meta"],
            json!({
                "branchId": "b1",
                "moduleId": "pos",
                "serverId": "ws-test",
                "version": 3,
                "updatedAt": "2026-01-01T00:00:00.000Z"
            })
        );
    }

    #[test]
    fn meta_layers_frame_then_overrides() {
        let (builder, _) = builder();
        let overrides = PublishOverrides {
            meta: json!({"reason": "override", "b": 2}).as_object().cloned(),
            frame_data: Some(json!({"meta": {"reason": "frame", "a": 1}})),
            ..PublishOverrides::default()
        };
        let meta = &builder.build(&state(), &overrides)["meta"];
        assert_eq!(meta["reason"], "override");
        assert_eq!(meta["a"], 1);
        assert_eq!(meta["b"], 2);
    }

    #[test]
    fn frame_fields_are_copied_except_reserved() {
        let (builder, _) = builder();
        let overrides = PublishOverrides {
            frame_data: Some(json!({
                "action": "create-order",
                "mutationId": "m1",
                "snapshot": {"ignored": true},
                "version": 99,
                "order": {"id": "o1"},
                "trans_id": "t1"
            })),
            ..PublishOverrides::default()
        };
        let payload = builder.build(&state(), &overrides);
        assert_eq!(payload["action"], "create-order");
        assert_eq!(payload["mutationId"], "m1");
        assert_eq!(payload["version"], 3);
        assert_eq!(payload["order"]["id"], "o1");
        assert_eq!(payload["trans_id"], "t1");
        assert!(payload["snapshot"].get("ignored").is_none());
    }

    #[test]
    fn explicit_overrides_win() {
        let (builder, _) = builder();
        let overrides = PublishOverrides {
            action: Some("module:insert".into()),
            mutation_id: Some(json!("m2")),
            version: Some(7),
            frame_data: Some(json!({"action": "other", "mutationId": "m1"})),
            ..PublishOverrides::default()
        };
        let payload = builder.build(&state(), &overrides);
        assert_eq!(payload["action"], "module:insert");
        assert_eq!(payload["mutationId"], "m2");
        assert_eq!(payload["version"], 7);
        assert_eq!(payload["meta"]["version"], 7);
    }

    #[test]
    fn active_flags_annotate_meta() {
        let (builder, flags) = builder();
        let _ = flags.enable("b1", "*", FlagOptions::default());
        let payload = builder.build(&state(), &PublishOverrides::default());
        assert_eq!(payload["meta"]["fullSyncRequired"], true);
        assert_eq!(payload["meta"]["fullSyncFlags"][0]["moduleId"], "*");

        let _ = flags.disable("b1", "*", FlagOptions::default());
        let payload = builder.build(&state(), &PublishOverrides::default());
        assert!(payload["meta"].get("fullSyncRequired").is_none());
    }

    #[test]
    fn flags_of_other_modules_do_not_annotate() {
        let (builder, flags) = builder();
        let _ = flags.enable("b1", "kds", FlagOptions::default());
        let _ = flags.enable("b2", "*", FlagOptions::default());
        let payload = builder.build(&state(), &PublishOverrides::default());
        assert!(payload["meta"].get("fullSyncRequired").is_none());
    }
}
