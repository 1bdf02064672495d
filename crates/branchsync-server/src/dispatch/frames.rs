//! Inbound frame normalization and outbound frame builders.
//!
//! Clients send loosely shaped JSON. [`InboundFrame::parse`] resolves field
//! aliases once so the dispatcher only ever sees typed frames.

use branchsync_core::json::{first_present, first_trimmed, key_part, now_iso};
use branchsync_engine::SyncError;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Malformed JSON.
pub const INVALID_JSON: &str = "invalid-json";
/// A branch-scoped frame arrived before `client:hello`.
pub const HANDSHAKE_REQUIRED: &str = "handshake-required";
/// No module id on a module-scoped frame.
pub const MISSING_MODULE: &str = "missing-module";
/// No table on a module event.
pub const MISSING_TABLE: &str = "missing-table";
/// A module event failed in storage.
pub const MODULE_EVENT_FAILED: &str = "module-event-failed";
/// `subscribe` without a topic.
pub const INVALID_TOPIC: &str = "invalid-topic";
/// Sync publish without a transaction id.
pub const MISSING_TRANS_ID: &str = "missing-trans-id";
/// The order processor failed.
pub const ORDER_PERSIST_FAILED: &str = "order-persist-failed";
/// A snapshot broke the insert-only policy.
pub const INSERT_ONLY_VIOLATION: &str = "insert-only-violation";
/// A snapshot could not be applied for another reason.
pub const SYNC_SNAPSHOT_FAILED: &str = "sync-snapshot-failed";
/// Unknown frame type.
pub const UNSUPPORTED_FRAME: &str = "unsupported-frame";

/// A typed error reported back to the offending connection.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct FrameError {
    /// Stable error code.
    pub code: &'static str,
    /// Human readable message.
    pub message: String,
    /// Topic the frame addressed.
    pub topic: Option<String>,
    /// Structured detail.
    pub details: Option<Value>,
}

impl FrameError {
    /// Error with a code and message.
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            topic: None,
            details: None,
        }
    }

    /// Attach the addressed topic.
    #[must_use]
    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_owned());
        self
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The `{type:"error", ...}` frame.
    pub fn to_frame(&self) -> Value {
        let mut frame = json!({"type": "error", "code": self.code, "message": self.message});
        if let Some(obj) = frame.as_object_mut() {
            if let Some(topic) = &self.topic {
                let _ = obj.insert("topic".into(), json!(topic));
            }
            if let Some(details) = &self.details {
                let _ = obj.insert("details".into(), details.clone());
            }
        }
        frame
    }
}

impl From<SyncError> for FrameError {
    fn from(error: SyncError) -> Self {
        match error.violation().and_then(|v| serde_json::to_value(v).ok()) {
            Some(details) => Self::new(INSERT_ONLY_VIOLATION, error.to_string()).with_details(details),
            None => Self::new(SYNC_SNAPSHOT_FAILED, error.to_string()),
        }
    }
}

/// `client:hello`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Hello {
    /// Requested branch.
    pub branch_id: Option<String>,
    /// Declared role.
    pub role: Option<String>,
    /// Acting user.
    pub user_id: Option<String>,
    /// Snapshot language.
    pub lang: Option<String>,
    /// Echoed in the snapshot meta.
    pub request_id: Option<Value>,
}

/// `client:publish`: one table-level mutation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientPublish {
    /// Target module.
    pub module_id: Option<String>,
    /// Mutation action as sent.
    pub action: Option<String>,
    /// Target table.
    pub table: Option<String>,
    /// The row.
    pub record: Value,
    /// Client mutation id (`mutationId`, else `id`).
    pub mutation_id: Option<Value>,
    /// Client meta.
    pub meta: Map<String, Value>,
    /// Entry point label.
    pub source: Option<String>,
    /// Client transaction id.
    pub trans_id: Option<String>,
}

/// Kind of `client:query`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryKind {
    /// Single record by id.
    Get,
    /// Every record matching an optional filter.
    List,
}

impl QueryKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::List => "list",
        }
    }
}

/// `client:query`.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// Echoed in the reply.
    pub request_id: Option<Value>,
    /// Target module.
    pub module_id: Option<String>,
    /// Target table.
    pub table: Option<String>,
    /// Query kind.
    pub kind: QueryKind,
    /// Record id for `get`.
    pub id: Option<String>,
    /// Equality filter for `list`.
    pub filter: Option<Map<String, Value>>,
}

/// Pub/sub `publish`.
#[derive(Clone, Debug, PartialEq)]
pub struct PubsubPublish {
    /// Target topic, trimmed.
    pub topic: Option<String>,
    /// The `data` object, or `{}`.
    pub data: Value,
}

/// A normalized inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// `client:hello`.
    Hello(Hello),
    /// `client:request:snapshot`.
    RequestSnapshot {
        /// Echoed in the snapshot meta.
        request_id: Option<Value>,
    },
    /// `client:request:history`.
    RequestHistory {
        /// Echoed in the snapshot meta.
        request_id: Option<Value>,
    },
    /// `client:publish`.
    ClientPublish(ClientPublish),
    /// `client:query`.
    Query(Query),
    /// Pub/sub `auth`.
    Auth,
    /// Pub/sub `ping`.
    Ping,
    /// Pub/sub `pong`.
    Pong,
    /// Pub/sub `subscribe`.
    Subscribe {
        /// Trimmed topic.
        topic: Option<String>,
    },
    /// Pub/sub `publish`.
    Publish(PubsubPublish),
    /// Anything else; carries the type if there was one.
    Unknown(Option<String>),
}

fn request_id(value: &Value) -> Option<Value> {
    first_present(value, &["requestId"]).cloned()
}

fn non_empty(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !matches!(v, Value::Null | Value::Bool(false)) && v.as_str() != Some(""))
}

impl InboundFrame {
    /// Parse raw text. Anything that is not a JSON object is `invalid-json`.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| FrameError::new(INVALID_JSON, "Received invalid JSON payload"))?;
        if !value.is_object() {
            return Err(FrameError::new(INVALID_JSON, "Received invalid JSON payload"));
        }
        Ok(Self::from_value(&value))
    }

    /// Normalize an already parsed object.
    pub fn from_value(value: &Value) -> Self {
        let frame_type = value.get("type").and_then(Value::as_str);
        match frame_type {
            Some("client:hello") => Self::Hello(Hello {
                branch_id: first_trimmed(value, &["branchId", "branch"]),
                role: value.get("role").and_then(Value::as_str).map(str::to_owned),
                user_id: first_trimmed(value, &["userId"]),
                lang: first_trimmed(value, &["lang"]),
                request_id: request_id(value),
            }),
            Some("client:request:snapshot") => Self::RequestSnapshot {
                request_id: request_id(value),
            },
            Some("client:request:history") => Self::RequestHistory {
                request_id: request_id(value),
            },
            Some("client:publish") => Self::ClientPublish(ClientPublish {
                module_id: first_trimmed(value, &["moduleId", "module"]),
                action: first_trimmed(value, &["action"]),
                table: first_trimmed(value, &["table", "tableName", "targetTable"]),
                record: first_present(value, &["record", "data"])
                    .cloned()
                    .unwrap_or_else(|| json!({})),
                mutation_id: non_empty(value.get("mutationId"))
                    .or_else(|| non_empty(value.get("id")))
                    .cloned(),
                meta: value
                    .get("meta")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
                source: first_trimmed(value, &["source"]),
                trans_id: branchsync_engine::dedup::resolve_trans_id(value),
            }),
            Some("client:query") => Self::Query(Query {
                request_id: request_id(value),
                module_id: first_trimmed(value, &["moduleId", "module"]),
                table: first_trimmed(value, &["table", "tableName"]),
                kind: match value.get("queryType").and_then(Value::as_str) {
                    Some("get") => QueryKind::Get,
                    _ => QueryKind::List,
                },
                id: first_present(value, &["id", "recordId"])
                    .and_then(key_part)
                    .filter(|id| !id.trim().is_empty()),
                filter: value.get("filter").and_then(Value::as_object).cloned(),
            }),
            Some("auth") => Self::Auth,
            Some("ping") => Self::Ping,
            Some("pong") => Self::Pong,
            Some("subscribe") => Self::Subscribe {
                topic: first_trimmed(value, &["topic"]),
            },
            Some("publish") => Self::Publish(PubsubPublish {
                topic: first_trimmed(value, &["topic"]),
                data: value
                    .get("data")
                    .filter(|d| d.is_object())
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            }),
            other => Self::Unknown(other.map(str::to_owned)),
        }
    }

    /// Whether the frame belongs to the pub/sub protocol.
    pub fn is_pubsub(&self) -> bool {
        matches!(
            self,
            Self::Auth | Self::Ping | Self::Pong | Self::Subscribe { .. } | Self::Publish(_)
        )
    }

    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "client:hello",
            Self::RequestSnapshot { .. } => "client:request:snapshot",
            Self::RequestHistory { .. } => "client:request:history",
            Self::ClientPublish(_) => "client:publish",
            Self::Query(_) => "client:query",
            Self::Auth => "auth",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Subscribe { .. } => "subscribe",
            Self::Publish(_) => "publish",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// `{type:"connection.established"}` sent on connect.
pub fn connection_established(client_id: &str) -> Value {
    json!({
        "type": "connection.established",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": { "clientId": client_id },
    })
}

/// Pub/sub acknowledgement.
pub fn pubsub_ack(event: &str, topic: Option<&str>) -> Value {
    let mut frame = json!({"type": "ack", "event": event});
    if let (Some(topic), Some(obj)) = (topic, frame.as_object_mut()) {
        let _ = obj.insert("topic".into(), json!(topic));
    }
    frame
}

/// Pub/sub pong.
pub fn pong() -> Value {
    json!({"type": "pong"})
}

/// Successful `client:query` reply.
pub fn query_result(request_id: Option<&Value>, table: Option<&str>, kind: QueryKind, result: Value) -> Value {
    json!({
        "type": "server:query:result",
        "requestId": request_id,
        "table": table,
        "queryType": kind.as_str(),
        "result": result,
        "timestamp": now_iso(),
    })
}

/// Failed `client:query` reply.
pub fn query_error(request_id: Option<&Value>, error: &str) -> Value {
    json!({
        "type": "server:query:error",
        "requestId": request_id,
        "error": error,
        "timestamp": now_iso(),
    })
}
