//! The pub/sub protocol: `auth`, `ping`, `subscribe`, and `publish`.
//!
//! Publishes on `sync:{branch}:{module}` topics go through the sync path:
//! transaction dedup, optional order persistence, the insert-only snapshot
//! gate, and finally a sync update broadcast. Any other topic is a plain
//! diffed broadcast.

use std::sync::Arc;

use branchsync_core::json::{first_trimmed, key_part, merge_into, millis_to_iso, now_millis};
use branchsync_core::store::{MutationContext, RejectedMutation};
use branchsync_engine::dedup::resolve_trans_id;
use branchsync_engine::naming::parse_sync_topic;
use branchsync_engine::{ApplyContext, PublishOverrides, SyncState, TopicRegistry, TransRecord};
use metrics::counter;
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use super::Dispatcher;
use super::frames::{
    self, FrameError, INVALID_TOPIC, InboundFrame, MISSING_TRANS_ID, ORDER_PERSIST_FAILED,
    PubsubPublish,
};
use crate::metrics::{SYNC_DUPLICATE_TRANSACTIONS_TOTAL, SYNC_INSERT_ONLY_REJECTIONS_TOTAL};
use crate::websocket::connection::ClientConnection;
use crate::websocket::cycle::{BroadcastCycle, CHANNEL_PUBSUB};

const ORDER_MODULE: &str = "pos";
const CREATE_ORDER: &str = "create-order";

/// Where a sync publish lands.
struct SyncTarget<'a> {
    topic: &'a str,
    branch_id: &'a str,
    module_id: &'a str,
    trans_id: &'a str,
}

impl Dispatcher {
    pub(super) async fn handle_pubsub(
        &self,
        conn: &Arc<ClientConnection>,
        frame: InboundFrame,
    ) -> Result<(), FrameError> {
        conn.mark_pubsub();
        match frame {
            InboundFrame::Ping => {
                let _ = self.sessions.send_to_client(conn, frames::pong());
            }
            InboundFrame::Pong => conn.mark_alive(),
            InboundFrame::Auth => {
                conn.authenticate();
                let _ = self.sessions.send_to_client(conn, frames::pubsub_ack("auth", None));
            }
            InboundFrame::Subscribe { topic } => self.subscribe(conn, topic).await?,
            InboundFrame::Publish(publish) => self.publish(conn, publish).await?,
            _ => {}
        }
        Ok(())
    }

    async fn subscribe(&self, conn: &Arc<ClientConnection>, topic: Option<String>) -> Result<(), FrameError> {
        let topic = topic.ok_or_else(|| FrameError::new(INVALID_TOPIC, "Subscription topic required."))?;
        conn.add_topic(&topic);
        let last = self.engine.topics.subscribe(&topic, &conn.id).await;
        let _ = self
            .sessions
            .send_to_client(conn, frames::pubsub_ack("subscribe", Some(&topic)));
        if let Some(last) = last {
            let replay = BroadcastCycle::new(TopicRegistry::replay_frame(&topic, &last), CHANNEL_PUBSUB);
            let _ = self.sessions.deliver(conn, &replay);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(conn_id = %conn.id, topic = publish.topic.as_deref()))]
    async fn publish(&self, conn: &Arc<ClientConnection>, publish: PubsubPublish) -> Result<(), FrameError> {
        let Some(topic) = publish.topic else {
            return Ok(());
        };
        let mut data = publish.data;
        if let Some(user) = first_trimmed(&data, &["userId"]) {
            conn.set_user_uuid(user);
        }
        let trans_id = resolve_trans_id(&data);

        let Some((branch_id, module_id)) = parse_sync_topic(&topic) else {
            let _ = self.broadcast_pubsub(&topic, &data).await;
            return Ok(());
        };
        let trans_id = trans_id.ok_or_else(|| {
            FrameError::new(MISSING_TRANS_ID, "Publish frames must include a trans_id.").with_topic(&topic)
        })?;
        let target = SyncTarget {
            topic: &topic,
            branch_id: &branch_id,
            module_id: &module_id,
            trans_id: &trans_id,
        };

        let _claim = self.engine.dedup.begin(&branch_id, &module_id, &trans_id).await;
        if let Some(record) = self.engine.dedup.recall(&branch_id, &module_id, &trans_id) {
            self.acknowledge_duplicate(conn, &target, record, &data).await;
            return Ok(());
        }

        let mut state = self.engine.state.ensure_state(&branch_id, &module_id).await;
        let is_order = module_id == ORDER_MODULE
            && data.get("action").and_then(Value::as_str) == Some(CREATE_ORDER)
            && data.get("order").is_some_and(Value::is_object);
        if is_order {
            state = self.persist_order(conn, &target, &mut data).await?;
        }

        if let Some(snapshot) = data.get("snapshot").filter(|s| s.is_object()) {
            let context = ApplyContext {
                partial: data.get("partial") == Some(&Value::Bool(true)),
                mutation: MutationContext {
                    client_id: Some(conn.id.clone()),
                    user_id: conn.user_uuid(),
                    source: Some("ws".into()),
                    trans_id: Some(trans_id.clone()),
                },
            };
            state = self
                .engine
                .state
                .apply_snapshot(&branch_id, &module_id, snapshot, &context)
                .await
                .map_err(|e| {
                    if let Some(violation) = e.violation() {
                        counter!(SYNC_INSERT_ONLY_REJECTIONS_TOTAL, "reason" => violation.reason.as_str())
                            .increment(1);
                    }
                    FrameError::from(e)
                })?;
        }

        let overrides = PublishOverrides {
            action: data.get("action").and_then(Value::as_str).map(str::to_owned),
            mutation_id: data.get("mutationId").cloned(),
            meta: data.get("meta").and_then(Value::as_object).cloned(),
            frame_data: Some(data.clone()),
            ..PublishOverrides::default()
        };
        let published = self.broadcast_sync_update(&state, &overrides).await;
        self.engine.dedup.remember(&branch_id, &module_id, &trans_id, &published);
        Ok(())
    }

    /// Re-acknowledge a transaction that was already applied, to the requester only.
    async fn acknowledge_duplicate(
        &self,
        conn: &ClientConnection,
        target: &SyncTarget<'_>,
        record: TransRecord,
        data: &Value,
    ) {
        counter!(SYNC_DUPLICATE_TRANSACTIONS_TOTAL).increment(1);
        let mut ack = record.payload.as_object().cloned().unwrap_or_default();
        let requested = first_trimmed(data, &["mutationId"]);
        let previous = ack
            .get("mutationId")
            .and_then(key_part)
            .filter(|id| !id.is_empty())
            .or(record.last_ack_mutation_id);
        if let Some(requested) = &requested {
            let _ = ack.insert("mutationId".into(), json!(requested));
        }
        let acked = requested.or_else(|| previous.clone());

        let mut meta = ack.get("meta").and_then(Value::as_object).cloned().unwrap_or_default();
        let _ = meta.insert("duplicateTrans".into(), Value::Bool(true));
        let _ = meta.insert("transId".into(), json!(target.trans_id));
        let _ = meta.insert("previousMutationId".into(), json!(previous));
        let _ = meta.insert("ackedMutationId".into(), json!(acked));
        if let Some(frame_meta) = data.get("meta").and_then(Value::as_object) {
            merge_into(&mut meta, frame_meta);
        }
        let _ = ack.insert("meta".into(), Value::Object(meta));

        let _ = self.engine.dedup.record_mutation_ack(
            target.branch_id,
            target.module_id,
            target.trans_id,
            acked.as_deref(),
        );
        info!(
            branch_id = target.branch_id,
            module_id = target.module_id,
            trans_id = target.trans_id,
            mutation_id = acked.as_deref(),
            "duplicate transaction acknowledged"
        );
        self.audit(
            target.branch_id,
            target.module_id,
            RejectedMutation {
                reason: "duplicate-trans-id".into(),
                source: "ws-publish".into(),
                trans_id: Some(target.trans_id.to_owned()),
                mutation_id: acked,
                meta: json!({
                    "previousMutationId": previous,
                    "clientId": conn.id,
                    "topic": target.topic,
                    "duplicateTrans": true,
                }),
                payload: data.clone(),
            },
        )
        .await;

        let _ = self.sessions.send_to_client(
            conn,
            json!({"type": "publish", "topic": target.topic, "data": Value::Object(ack)}),
        );
    }

    /// Persist the order of a `create-order` publish and annotate the frame
    /// with the stored order and persistence meta.
    async fn persist_order(
        &self,
        conn: &ClientConnection,
        target: &SyncTarget<'_>,
        data: &mut Value,
    ) -> Result<Arc<SyncState>, FrameError> {
        let order = data.get("order").cloned().unwrap_or(Value::Null);
        let context = MutationContext {
            client_id: Some(conn.id.clone()),
            user_id: conn.user_uuid(),
            source: None,
            trans_id: Some(target.trans_id.to_owned()),
        };
        let outcome = self
            .orders
            .process_order(target.branch_id, target.module_id, &order, &context)
            .await
            .map_err(|e| {
                warn!(branch_id = target.branch_id, error = %e, "failed to persist order");
                FrameError::new(ORDER_PERSIST_FAILED, e.to_string())
            })?;

        let persisted_at = ["savedAt", "updatedAt"]
            .iter()
            .find_map(|key| outcome.order.get(*key).and_then(Value::as_i64))
            .unwrap_or_else(now_millis);
        let order_id = outcome.order.get("id").cloned().unwrap_or(Value::Null);

        if let Some(fields) = data.as_object_mut() {
            let mut meta = fields
                .get("meta")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_else(Map::new);
            let _ = meta.insert("persisted".into(), Value::Bool(true));
            let _ = meta.insert("persistedAt".into(), json!(persisted_at));
            let _ = meta.insert("persistedAtIso".into(), json!(millis_to_iso(persisted_at)));
            let _ = meta.insert("branchId".into(), json!(target.branch_id));
            let _ = meta.insert("moduleId".into(), json!(target.module_id));
            let _ = meta.insert("existing".into(), Value::Bool(outcome.existing));
            let _ = fields.insert("meta".into(), Value::Object(meta));
            let _ = fields.insert("order".into(), outcome.order);
            if outcome.existing {
                let _ = fields.insert("existing".into(), Value::Bool(true));
            }
        }

        if outcome.existing {
            self.audit(
                target.branch_id,
                target.module_id,
                RejectedMutation {
                    reason: "duplicate-order".into(),
                    source: "ws-pos-order".into(),
                    trans_id: Some(target.trans_id.to_owned()),
                    mutation_id: data.get("mutationId").and_then(key_part),
                    meta: json!({
                        "orderId": order_id,
                        "clientId": conn.id,
                        "existing": true,
                        "topic": target.topic,
                    }),
                    payload: data.clone(),
                },
            )
            .await;
        }

        match self.engine.state.refresh(target.branch_id, target.module_id).await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(branch_id = target.branch_id, error = %e, "failed to refresh state after order");
                Ok(self.engine.state.ensure_state(target.branch_id, target.module_id).await)
            }
        }
    }
}
