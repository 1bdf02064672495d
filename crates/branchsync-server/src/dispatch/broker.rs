//! Fan-out of pub/sub publishes, sync updates, and table notices.

use branchsync_engine::naming::{
    branch_delta_detail, branch_suffix_for_table, branch_topic, branch_topic_payload,
    branch_topics_from_frame, sync_topics, table_notice_topics,
};
use branchsync_engine::tables::{all_table_names, normalize_table_identifier};
use branchsync_engine::{PublishOverrides, SyncState};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::Dispatcher;
use crate::metrics::record_broadcast;
use crate::websocket::cycle::{BroadcastCycle, CHANNEL_PUBSUB};

impl Dispatcher {
    /// Publish `data` on a topic and deliver the envelope to its subscribers.
    ///
    /// Returns the number of connections reached; zero when the publish was
    /// suppressed as unchanged.
    pub async fn broadcast_pubsub(&self, topic: &str, data: &Value) -> usize {
        let sent = self
            .engine
            .topics
            .publish_with(topic, data, |outcome| {
                let cycle = BroadcastCycle::new(outcome.frame, CHANNEL_PUBSUB);
                (outcome.subscribers.len(), self.sessions.send_to_ids(&outcome.subscribers, &cycle))
            })
            .await;
        let Some((subscribers, delivered)) = sent else {
            debug!(topic, "publish suppressed, payload unchanged");
            return 0;
        };
        record_broadcast(CHANNEL_PUBSUB, delivered);
        debug!(topic, subscribers, delivered, "published");
        delivered
    }

    /// Build the sync payload of `state`, publish it on the module's sync
    /// topics, and mirror a delta onto every branch topic the frame implies.
    pub async fn broadcast_sync_update(&self, state: &SyncState, overrides: &PublishOverrides) -> Value {
        let payload = self.engine.payloads.build(state, overrides);
        for topic in sync_topics(&state.branch_id, &state.module_id) {
            let _ = self.broadcast_pubsub(&topic, &payload).await;
        }

        let frame = overrides.frame_data.clone().unwrap_or_else(|| json!({}));
        let suffixes = branch_topics_from_frame(&frame, &payload);
        if !suffixes.is_empty() {
            let detail = branch_delta_detail(&state.branch_id, &payload, &frame);
            for suffix in suffixes {
                let topic = branch_topic(&state.branch_id, suffix);
                let body = branch_topic_payload(&state.branch_id, suffix, &detail);
                let _ = self.broadcast_pubsub(&topic, &body).await;
            }
        }
        payload
    }

    /// Announce a table-level change on the table notice topics of every
    /// alias of `table`, and on the branch topic the table maps to.
    pub async fn broadcast_table_notice(
        &self,
        branch_id: &str,
        module_id: &str,
        table: &str,
        notice: &Map<String, Value>,
    ) {
        for variant in all_table_names(table) {
            let mut body = Map::new();
            let _ = body.insert("type".into(), json!("table:update"));
            let _ = body.insert("branchId".into(), json!(branch_id));
            let _ = body.insert("moduleId".into(), json!(module_id));
            let _ = body.insert("table".into(), json!(variant));
            body.extend(notice.clone());
            let body = Value::Object(body);
            for topic in table_notice_topics(branch_id, module_id, &variant) {
                let _ = self.broadcast_pubsub(&topic, &body).await;
            }
        }

        let Some(suffix) = branch_suffix_for_table(table) else {
            return;
        };
        let mut detail = Map::new();
        let _ = detail.insert("type".into(), json!("branch:table-notice"));
        let _ = detail.insert("table".into(), json!(normalize_table_identifier(table)));
        let _ = detail.insert("moduleId".into(), json!(module_id));
        let _ = detail.insert(
            "action".into(),
            notice.get("action").cloned().unwrap_or_else(|| json!("table:update")),
        );
        for key in ["eventId", "sequence", "recordRef"] {
            let _ = detail.insert(key.into(), notice.get(key).cloned().unwrap_or(Value::Null));
        }
        if let Some(meta) = notice.get("meta").filter(|m| m.is_object()) {
            let _ = detail.insert("meta".into(), meta.clone());
        }
        let body = branch_topic_payload(branch_id, suffix, &Value::Object(detail));
        let _ = self.broadcast_pubsub(&branch_topic(branch_id, suffix), &body).await;
    }
}
