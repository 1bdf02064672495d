//! Broadcast cycles.
//!
//! A cycle wraps one outbound frame for the duration of a fan-out. The frame
//! is serialized on first use and the same `Arc<String>` is handed to every
//! recipient.

use std::sync::{Arc, OnceLock};

use metrics::counter;
use serde_json::Value;
use tracing::warn;

use crate::metrics::WS_SERIALIZATIONS_TOTAL;

/// Fan-out channel label: direct replies.
pub const CHANNEL_DIRECT: &str = "direct";
/// Fan-out channel label: branch-wide broadcasts.
pub const CHANNEL_BRANCH: &str = "branch";
/// Fan-out channel label: pub/sub topic deliveries.
pub const CHANNEL_PUBSUB: &str = "pubsub";

/// One frame shared by every recipient of a fan-out.
pub struct BroadcastCycle {
    frame: Value,
    channel: &'static str,
    serialized: OnceLock<Option<Arc<String>>>,
}

impl BroadcastCycle {
    /// Start a cycle for `frame` on `channel`.
    pub fn new(frame: Value, channel: &'static str) -> Self {
        Self {
            frame,
            channel,
            serialized: OnceLock::new(),
        }
    }

    /// The frame being delivered.
    pub fn frame(&self) -> &Value {
        &self.frame
    }

    /// Channel label for metrics.
    pub fn channel(&self) -> &'static str {
        self.channel
    }

    /// Serialized frame. Serialization runs at most once per cycle; `None`
    /// when it failed.
    pub fn payload(&self) -> Option<Arc<String>> {
        if let Some(cached) = self.serialized.get() {
            counter!(WS_SERIALIZATIONS_TOTAL, "result" => "hit").increment(1);
            return cached.clone();
        }
        self.serialized
            .get_or_init(|| match serde_json::to_string(&self.frame) {
                Ok(json) => {
                    counter!(WS_SERIALIZATIONS_TOTAL, "result" => "miss").increment(1);
                    Some(Arc::new(json))
                }
                Err(e) => {
                    counter!(WS_SERIALIZATIONS_TOTAL, "result" => "error").increment(1);
                    warn!(channel = self.channel, error = %e, "failed to serialize frame");
                    None
                }
            })
            .clone()
    }
}
