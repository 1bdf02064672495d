//! JSON and timestamp helpers used across frame handling and storage.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current UTC time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render epoch milliseconds as RFC 3339, falling back to now when out of range.
pub fn millis_to_iso(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map_or_else(now_iso, |dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// The trimmed contents of a string value, or `None` if absent, blank, or not a string.
pub fn trimmed_str(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// First non-blank string found under any of `keys`.
pub fn first_trimmed(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(trimmed_str)
        .map(str::to_owned)
}

/// First value under `keys` that is neither missing nor `null`.
pub fn first_present<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
}

/// String form of a scalar used when building composite keys.
///
/// Returns `None` for `null` so callers can detect missing key parts.
pub fn key_part(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Shallow-merge `overlay` into `base`; overlay keys win.
pub fn merge_into(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        let _ = base.insert(key.clone(), value.clone());
    }
}

/// Object view of a value, if it is one.
pub fn as_object(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value.and_then(Value::as_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trimmed_str_rejects_blank() {
        assert_eq!(trimmed_str(&json!("  x ")), Some("x"));
        assert_eq!(trimmed_str(&json!("   ")), None);
        assert_eq!(trimmed_str(&json!(5)), None);
    }

    #[test]
    fn first_trimmed_walks_keys_in_order() {
        let v = json!({"branch": "b2", "branchId": ""});
        assert_eq!(first_trimmed(&v, &["branchId", "branch"]).as_deref(), Some("b2"));
        assert_eq!(first_trimmed(&v, &["missing"]), None);
    }

    #[test]
    fn first_present_skips_null() {
        let v = json!({"record": null, "data": {"id": 1}});
        assert_eq!(first_present(&v, &["record", "data"]), Some(&json!({"id": 1})));
    }

    #[test]
    fn key_part_formats_scalars() {
        assert_eq!(key_part(&json!("a")).as_deref(), Some("a"));
        assert_eq!(key_part(&json!(42)).as_deref(), Some("42"));
        assert_eq!(key_part(&json!(true)).as_deref(), Some("true"));
        assert_eq!(key_part(&Value::Null), None);
    }

    #[test]
    fn merge_into_overrides() {
        let mut base = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
        let overlay = json!({"b": 3, "c": 4}).as_object().cloned().unwrap();
        merge_into(&mut base, &overlay);
        assert_eq!(Value::Object(base), json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn millis_round_trip_to_iso() {
        assert_eq!(millis_to_iso(0), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn now_iso_is_utc() {
        assert!(now_iso().ends_with('Z'));
    }
}
