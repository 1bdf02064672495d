//! Snapshot and delta envelopes for topic publishes.

use serde::Serialize;
use serde_json::{Map, Value};

/// Wire description of a topic update.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Envelope {
    /// The whole payload.
    Snapshot {
        /// Payload, `null` when none is known.
        snapshot: Value,
    },
    /// Top-level keys that changed since the previous payload.
    Delta {
        /// Keys whose value differs from the previous payload.
        set: Map<String, Value>,
        /// Keys present before but absent now.
        #[serde(skip_serializing_if = "Vec::is_empty")]
        remove: Vec<String>,
    },
}

impl Envelope {
    /// Render as a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Full snapshot envelope of `state`.
pub fn snapshot_envelope(state: Option<&Value>) -> Envelope {
    Envelope::Snapshot {
        snapshot: state.cloned().unwrap_or(Value::Null),
    }
}

/// Shallow key-level diff of two payloads.
///
/// Returns `None` when nothing changed. Non-object payloads on either side
/// fall back to a snapshot of `next`.
pub fn delta_envelope(previous: &Value, next: &Value) -> Option<Envelope> {
    let (Value::Object(prev), Value::Object(next_map)) = (previous, next) else {
        return Some(snapshot_envelope(Some(next)));
    };
    let set: Map<String, Value> = next_map
        .iter()
        .filter(|(key, value)| !prev.get(*key).is_some_and(|old| deep_equal(old, value)))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let remove: Vec<String> = prev
        .keys()
        .filter(|key| !next_map.contains_key(*key))
        .cloned()
        .collect();
    if set.is_empty() && remove.is_empty() {
        return None;
    }
    Some(Envelope::Delta { set, remove })
}

/// Structural equality where numbers compare by value, so `1` equals `1.0`.
#[allow(clippy::float_cmp)]
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(key, x)| y.get(key).is_some_and(|y| deep_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Envelope for publishing `next` over a topic whose last payload is `previous`.
pub fn envelope_for(previous: Option<&Value>, next: &Value) -> Option<Envelope> {
    match previous {
        Some(prev) if !prev.is_null() => delta_envelope(prev, next),
        _ => Some(snapshot_envelope(Some(next))),
    }
}
