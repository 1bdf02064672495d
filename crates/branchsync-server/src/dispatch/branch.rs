//! The branch protocol: handshake, snapshots, module events, and queries.

use std::sync::Arc;

use branchsync_core::EventId;
use branchsync_core::json::now_iso;
use branchsync_core::store::{MutationAction, MutationContext};
use branchsync_engine::PublishOverrides;
use metrics::counter;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use super::Dispatcher;
use super::frames::{
    self, ClientPublish, FrameError, HANDSHAKE_REQUIRED, Hello, MISSING_MODULE, MISSING_TABLE,
    MODULE_EVENT_FAILED, Query, QueryKind,
};
use crate::metrics::SYNC_MODULE_EVENTS_TOTAL;
use crate::websocket::connection::{ClientConnection, ClientIdentity};

fn handshake_required() -> FrameError {
    FrameError::new(HANDSHAKE_REQUIRED, "Send client:hello before branch frames.")
}

fn missing_module() -> FrameError {
    FrameError::new(MISSING_MODULE, "A moduleId is required.")
}

impl Dispatcher {
    /// Register the connection with its branch and send the initial snapshot.
    pub(super) async fn hello(&self, conn: &Arc<ClientConnection>, hello: Hello) {
        let branch_id = hello.branch_id.unwrap_or_else(|| self.default_branch.clone());
        let role = hello.role.unwrap_or_else(|| "unknown".to_owned());
        conn.set_identity(ClientIdentity {
            branch_id: Some(branch_id.clone()),
            role: Some(role.clone()),
            user_uuid: hello.user_id.or_else(|| conn.user_uuid()),
            lang: hello.lang.clone(),
        });
        self.sessions.assign_branch(&conn.id, &branch_id);
        info!(conn_id = %conn.id, branch_id, role, lang = hello.lang.as_deref(), "client registered");

        let _ = self.sessions.send_server_log(
            conn,
            "info",
            "Client registered",
            json!({"branchId": branch_id, "role": role, "lang": hello.lang}),
        );
        self.send_snapshot(conn, "initial-sync", hello.request_id).await;
    }

    /// Send `server:snapshot` with every module of the connection's branch.
    ///
    /// Does nothing before the handshake.
    pub async fn send_snapshot(&self, conn: &ClientConnection, reason: &str, request_id: Option<Value>) {
        let Some(branch_id) = conn.branch_id() else {
            return;
        };
        let lang = conn.lang();
        let stores = self
            .storage()
            .branch_modules(&branch_id)
            .await
            .unwrap_or_else(|e| {
                warn!(branch_id, error = %e, "failed to load branch modules");
                Vec::new()
            });

        let mut modules = Map::new();
        for store in stores {
            let snapshot = serde_json::to_value(store.snapshot(lang.as_deref())).unwrap_or(Value::Null);
            let _ = modules.insert(store.module_id().to_owned(), snapshot);
        }

        let flags = self.engine.flags.serialized_for_branch(&branch_id);
        let mut meta = Map::new();
        let _ = meta.insert("reason".into(), json!(reason));
        if let Some(request_id) = request_id {
            let _ = meta.insert("requestId".into(), request_id);
        }
        let _ = meta.insert("serverId".into(), json!(self.engine.server_id()));
        let _ = meta.insert("branchId".into(), json!(branch_id));
        if let Some(lang) = &lang {
            let _ = meta.insert("lang".into(), json!(lang));
        }
        if !flags.is_empty() {
            let _ = meta.insert("fullSyncRequired".into(), Value::Bool(true));
            let _ = meta.insert("fullSyncFlags".into(), Value::Array(flags.clone()));
        }

        let _ = self.sessions.send_to_client(
            conn,
            json!({
                "type": "server:snapshot",
                "branchId": branch_id,
                "modules": modules,
                "fullSyncFlags": flags,
                "meta": meta,
            }),
        );
    }

    /// Apply one table-level mutation and announce it.
    ///
    /// The requester gets `server:ack`, the branch gets `server:event`, table
    /// notice topics get `table:update`, and the module's sync topic gets a
    /// fresh payload.
    pub(super) async fn client_publish(
        &self,
        conn: &Arc<ClientConnection>,
        publish: ClientPublish,
    ) -> Result<(), FrameError> {
        let branch_id = conn.branch_id().ok_or_else(handshake_required)?;
        let module_id = publish.module_id.clone().ok_or_else(missing_module)?;
        let table = publish
            .table
            .clone()
            .ok_or_else(|| FrameError::new(MISSING_TABLE, "Module events must name a table."))?;
        let action_name = publish
            .action
            .clone()
            .unwrap_or_else(|| MutationAction::Insert.as_str().to_owned());
        let action: MutationAction = action_name
            .parse()
            .map_err(|e: branchsync_core::StorageError| FrameError::new(MODULE_EVENT_FAILED, e.to_string()))?;

        let context = MutationContext {
            client_id: Some(conn.id.clone()),
            user_id: conn.user_uuid(),
            source: Some(publish.source.clone().unwrap_or_else(|| "ws-client".to_owned())),
            trans_id: publish.trans_id.clone(),
        };
        let (outcome, state) = self
            .engine
            .state
            .apply_mutation(&branch_id, &module_id, &table, action, &publish.record, &context)
            .await
            .map_err(|e| {
                warn!(branch_id, module_id, table, error = %e, "module event failed");
                FrameError::new(MODULE_EVENT_FAILED, e.to_string())
            })?;
        counter!(SYNC_MODULE_EVENTS_TOTAL, "action" => outcome.action.as_str()).increment(1);

        let sequence = self.next_sequence(&branch_id, &module_id);
        let event_id = EventId::new();
        let record = outcome.record.clone().unwrap_or(Value::Null);
        let record_ref = json!({"table": table, "id": record.get("id").cloned().unwrap_or(Value::Null)});

        let mut meta = publish.meta.clone();
        let _ = meta.insert("eventId".into(), json!(event_id));
        let _ = meta.insert("sequence".into(), json!(sequence));
        let _ = meta.insert("recordRef".into(), record_ref.clone());
        let meta = Value::Object(meta);

        let entry = json!({
            "id": record_ref["id"],
            "table": table,
            "action": outcome.action.as_str(),
            "recordRef": record_ref,
            "meta": meta,
            "created": outcome.created,
            "deleted": outcome.deleted,
        });
        let mut notice = Map::new();
        let _ = notice.insert("action".into(), json!(outcome.action.as_str()));
        let _ = notice.insert("recordRef".into(), record_ref.clone());
        let _ = notice.insert("eventId".into(), json!(event_id));
        let _ = notice.insert("sequence".into(), json!(sequence));
        let _ = notice.insert("version".into(), json!(outcome.version));
        let _ = notice.insert("timestamp".into(), json!(now_iso()));
        let _ = notice.insert("created".into(), json!(outcome.created));
        let _ = notice.insert("deleted".into(), json!(outcome.deleted));
        let _ = notice.insert("meta".into(), meta.clone());

        let _ = self.sessions.send_to_client(
            conn,
            json!({
                "type": "server:ack",
                "action": outcome.action.as_str(),
                "branchId": branch_id,
                "moduleId": module_id,
                "version": outcome.version,
                "table": table,
                "record": record,
                "recordRef": record_ref,
                "eventId": event_id,
                "sequence": sequence,
                "meta": meta,
                "entry": entry,
                "created": outcome.created,
                "deleted": outcome.deleted,
            }),
        );

        let mut event = Map::new();
        let _ = event.insert("type".into(), json!("server:event"));
        let _ = event.insert("branchId".into(), json!(branch_id));
        let _ = event.insert("moduleId".into(), json!(module_id));
        let _ = event.insert("table".into(), json!(table));
        let _ = event.insert("record".into(), record);
        let _ = event.insert("entry".into(), entry);
        event.extend(notice.clone());
        let _ = self.sessions.broadcast_to_branch(&branch_id, Value::Object(event));

        self.broadcast_table_notice(&branch_id, &module_id, &table, &notice).await;

        let overrides = PublishOverrides {
            action: Some(action_name),
            mutation_id: publish.mutation_id,
            meta: Some(Map::from_iter([
                ("table".to_owned(), json!(table)),
                ("source".to_owned(), json!("ws-client-insert")),
                ("clientId".to_owned(), json!(conn.id)),
            ])),
            ..PublishOverrides::default()
        };
        let _ = self.broadcast_sync_update(&state, &overrides).await;
        Ok(())
    }

    /// Answer `client:query` with `server:query:result` or `server:query:error`.
    pub(super) async fn client_query(&self, conn: &ClientConnection, query: Query) -> Result<(), FrameError> {
        let branch_id = conn.branch_id().ok_or_else(handshake_required)?;
        let module_id = query.module_id.clone().ok_or_else(missing_module)?;

        let reply = match self.run_query(&branch_id, &module_id, &query).await {
            Ok(result) => frames::query_result(
                query.request_id.as_ref(),
                query.table.as_deref(),
                query.kind,
                result,
            ),
            Err(message) => {
                warn!(branch_id, module_id, error = %message, "query failed");
                frames::query_error(query.request_id.as_ref(), &message)
            }
        };
        let _ = self.sessions.send_to_client(conn, reply);
        Ok(())
    }

    async fn run_query(&self, branch_id: &str, module_id: &str, query: &Query) -> Result<Value, String> {
        let table = query.table.as_deref().ok_or("Missing table for query")?;
        let store = self
            .storage()
            .ensure_module_store(branch_id, module_id)
            .await
            .map_err(|e| e.to_string())?;
        match query.kind {
            QueryKind::Get => {
                let id = query.id.as_deref().ok_or("Missing record ID for get query")?;
                let record = store.get_record(table, id).map_err(|e| e.to_string())?;
                Ok(record.unwrap_or(Value::Null))
            }
            QueryKind::List => {
                let rows = store
                    .query_table(table, query.filter.as_ref())
                    .map_err(|e| e.to_string())?;
                Ok(Value::Array(rows))
            }
        }
    }
}
