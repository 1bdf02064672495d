//! Topic registry.
//!
//! Maps each topic to its subscriber set and last delivered payload. Publishing
//! diffs the next payload against the last one and reports the frame and
//! recipients; delivery is left to the caller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::debug;

use crate::envelope::{Envelope, envelope_for, snapshot_envelope};
use crate::naming::parse_sync_topic;
use crate::payload::{PublishOverrides, SyncPayloadBuilder};
use crate::state::StateStore;

/// Subscriber bookkeeping of one topic.
#[derive(Clone, Debug, Default)]
pub struct TopicRecord {
    /// Subscribed connection ids.
    pub subscribers: HashSet<String>,
    /// Last payload delivered, the diff baseline.
    pub last_data: Option<Value>,
}

/// A non-suppressed publish, ready for fan-out.
#[derive(Clone, Debug, PartialEq)]
pub struct PublishOutcome {
    /// `{type:"publish", topic, data: envelope}`.
    pub frame: Value,
    /// Connection ids subscribed at publish time.
    pub subscribers: Vec<String>,
}

/// A `publish` frame carrying an envelope.
pub fn publish_frame(topic: &str, envelope: &Envelope) -> Value {
    json!({"type": "publish", "topic": topic, "data": envelope.to_value()})
}

/// Registry of every live topic.
pub struct TopicRegistry {
    topics: RwLock<HashMap<String, TopicRecord>>,
    state: Arc<StateStore>,
    payloads: Arc<SyncPayloadBuilder>,
}

impl TopicRegistry {
    /// Create a registry bootstrapping sync topics from `state`.
    pub fn new(state: Arc<StateStore>, payloads: Arc<SyncPayloadBuilder>) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            state,
            payloads,
        }
    }

    /// Initial payload of a topic: the current sync payload for sync topics,
    /// nothing for anything else.
    pub async fn load_bootstrap(&self, topic: &str) -> Option<Value> {
        let (branch_id, module_id) = parse_sync_topic(topic)?;
        let state = self.state.ensure_state(&branch_id, &module_id).await;
        Some(self.payloads.build(
            &state,
            &PublishOverrides::with_meta(json!({"reason": "bootstrap"})),
        ))
    }

    /// Create the topic if needed and bootstrap its payload. Returns the
    /// current last payload.
    pub async fn ensure_topic(&self, topic: &str) -> Option<Value> {
        {
            let mut topics = self.topics.write();
            let record = topics.entry(topic.to_owned()).or_default();
            if record.last_data.is_some() {
                return record.last_data.clone();
            }
        }

        let bootstrap = self.load_bootstrap(topic).await;

        let mut topics = self.topics.write();
        let record = topics.entry(topic.to_owned()).or_default();
        if record.last_data.is_none() {
            record.last_data = bootstrap;
        }
        record.last_data.clone()
    }

    /// Add a subscriber. Returns the payload to replay to it, if any.
    pub async fn subscribe(&self, topic: &str, conn_id: &str) -> Option<Value> {
        let _ = self.ensure_topic(topic).await;
        let mut topics = self.topics.write();
        let record = topics.entry(topic.to_owned()).or_default();
        let _ = record.subscribers.insert(conn_id.to_owned());
        if record.last_data.is_none() {
            debug!(topic, "no bootstrap payload available for subscription");
        }
        record.last_data.clone()
    }

    /// The replay frame for a new subscriber.
    pub fn replay_frame(topic: &str, last_data: &Value) -> Value {
        publish_frame(topic, &snapshot_envelope(Some(last_data)))
    }

    /// Remove a connection from every topic, deleting topics it leaves empty.
    ///
    /// Returns the number of topics the connection was removed from.
    pub fn unsubscribe(&self, conn_id: &str) -> usize {
        let mut removed = 0;
        self.topics.write().retain(|_, record| {
            if record.subscribers.remove(conn_id) {
                removed += 1;
                !record.subscribers.is_empty()
            } else {
                true
            }
        });
        removed
    }

    /// Diff `next` against the topic's last payload and record it.
    ///
    /// Returns `None` when the publish is suppressed as a no-op.
    pub async fn publish(&self, topic: &str, next: &Value) -> Option<PublishOutcome> {
        self.publish_with(topic, next, |outcome| outcome).await
    }

    /// Like [`Self::publish`], handing the outcome to `deliver` before the
    /// registry lock is released.
    ///
    /// Deliveries therefore reach subscribers in the order `last_data`
    /// advanced. `deliver` must not call back into the registry.
    pub async fn publish_with<R>(
        &self,
        topic: &str,
        next: &Value,
        deliver: impl FnOnce(PublishOutcome) -> R,
    ) -> Option<R> {
        let _ = self.ensure_topic(topic).await;
        let mut topics = self.topics.write();
        let record = topics.entry(topic.to_owned()).or_default();
        let envelope = envelope_for(record.last_data.as_ref(), next)?;
        record.last_data = Some(next.clone());
        let outcome = PublishOutcome {
            frame: publish_frame(topic, &envelope),
            subscribers: record.subscribers.iter().cloned().collect(),
        };
        Some(deliver(outcome))
    }

    /// Number of live topics.
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Subscriber ids of a topic.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.topics
            .read()
            .get(topic)
            .map(|r| r.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last payload of a topic.
    pub fn last_data(&self, topic: &str) -> Option<Value> {
        self.topics.read().get(topic).and_then(|r| r.last_data.clone())
    }

    /// Whether the topic exists.
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.read().contains_key(topic)
    }
}
