//! Topic naming.
//!
//! - `sync:{branch}:{module}` carries module sync payloads
//! - `table:{branch}::{module}::{table}`, `table:{branch}::{table}` and
//!   `global:table:{table}` carry table notices
//! - `{branch}:{suffix}` carries branch-level order, job and payment deltas

use serde_json::{Map, Value, json};

use branchsync_core::json::now_iso;

use crate::tables::normalize_table_identifier;

/// Prefix of module sync topics.
pub const SYNC_TOPIC_PREFIX: &str = "sync:";
/// Prefix of branch and module scoped table notice topics.
pub const TABLE_TOPIC_PREFIX: &str = "table:";
/// Prefix of cross-branch table notice topics.
pub const GLOBAL_TABLE_TOPIC_PREFIX: &str = "global:table:";

/// Branch topic suffix for order updates.
pub const ORDERS_SUFFIX: &str = "pos:kds:orders";
/// Branch topic suffix for kitchen job updates.
pub const JOBS_SUFFIX: &str = "kds:jobs:updates";
/// Branch topic suffix for payment updates.
pub const PAYMENTS_SUFFIX: &str = "pos:payments";

const DEFAULT_BRANCH: &str = "default";
const DEFAULT_MODULE: &str = "pos";

fn or_default<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() { fallback } else { value }
}

/// Split a sync topic into `(branch, module)`.
///
/// The module is the last `:` segment, so branch ids may themselves contain
/// colons (`lab:test-pad`).
pub fn parse_sync_topic(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix(SYNC_TOPIC_PREFIX)?;
    let (branch, module) = rest.rsplit_once(':')?;
    if branch.is_empty() || module.is_empty() {
        return None;
    }
    Some((branch.to_owned(), module.to_owned()))
}

/// Sync topics of a module.
pub fn sync_topics(branch_id: &str, module_id: &str) -> Vec<String> {
    vec![format!(
        "{SYNC_TOPIC_PREFIX}{}:{}",
        or_default(branch_id, DEFAULT_BRANCH),
        or_default(module_id, DEFAULT_MODULE)
    )]
}

/// Notice topics of one table name.
pub fn table_notice_topics(branch_id: &str, module_id: &str, table: &str) -> Vec<String> {
    let branch = or_default(branch_id, DEFAULT_BRANCH);
    let module = or_default(module_id, DEFAULT_MODULE);
    let table = or_default(table, "default");
    vec![
        format!("{TABLE_TOPIC_PREFIX}{branch}::{module}::{table}"),
        format!("{TABLE_TOPIC_PREFIX}{branch}::{table}"),
        format!("{GLOBAL_TABLE_TOPIC_PREFIX}{table}"),
    ]
}

/// Branch-scoped topic for a suffix.
pub fn branch_topic(branch_id: &str, suffix: &str) -> String {
    format!("{}:{suffix}", or_default(branch_id, DEFAULT_BRANCH))
}

/// Branch topic suffix a table name maps to, if any.
pub fn branch_suffix_for_table(table: &str) -> Option<&'static str> {
    match normalize_table_identifier(table).as_str() {
        "orders" | "order" | "order_headers" | "orderheaders" | "job_orders" | "joborders" => {
            Some(ORDERS_SUFFIX)
        }
        "jobs" | "kds_jobs" | "kdsjobs" | "job_queue" | "jobqueue" => Some(JOBS_SUFFIX),
        "payments" | "payment_records" | "paymentrecords" | "order_payments" | "pos_payments"
        | "pospayments" => Some(PAYMENTS_SUFFIX),
        _ => None,
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn first_truthy<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .map(|key| value.get(*key))
        .find(|v| truthy(*v))
        .flatten()
}

/// Branch topic suffixes implied by a publish frame and its sync payload.
///
/// Returned in first-seen order without duplicates.
pub fn branch_topics_from_frame(frame: &Value, payload: &Value) -> Vec<&'static str> {
    let mut suffixes = Vec::new();
    let mut add = |suffix: &'static str| {
        if !suffixes.contains(&suffix) {
            suffixes.push(suffix);
        }
    };

    let structured = ["order", "orders", "jobOrders"]
        .iter()
        .any(|key| matches!(frame.get(*key), Some(Value::Array(_) | Value::Object(_))));
    if structured || first_truthy(frame, &["orderId", "orderID"]).is_some() {
        add(ORDERS_SUFFIX);
    }
    if first_truthy(frame, &["jobId", "job", "jobs", "jobOrders"]).is_some() {
        add(JOBS_SUFFIX);
    }
    if first_truthy(frame, &["payment", "payments", "paymentId", "paymentID"]).is_some() {
        add(PAYMENTS_SUFFIX);
    }

    let frame_meta = frame.get("meta");
    let payload_meta = payload.get("meta");
    let candidates = [
        frame.get("table"),
        frame.get("tableName"),
        frame.get("targetTable"),
        frame_meta.and_then(|m| m.get("table")),
        frame_meta.and_then(|m| m.get("tableName")),
        payload_meta.and_then(|m| m.get("table")),
        payload.get("table"),
    ];
    for candidate in candidates.into_iter().flatten().filter_map(Value::as_str) {
        if let Some(suffix) = branch_suffix_for_table(candidate) {
            add(suffix);
        }
    }
    suffixes
}

fn pick(sources: &[(&Value, &str)], fallback: Value) -> Value {
    sources
        .iter()
        .map(|(source, key)| source.get(*key))
        .find(|v| truthy(*v))
        .flatten()
        .cloned()
        .unwrap_or(fallback)
}

/// The `branch:delta` detail published on branch topics after a sync update.
pub fn branch_delta_detail(branch_id: &str, payload: &Value, frame: &Value) -> Value {
    let mut detail = Map::new();
    let _ = detail.insert("type".into(), json!("branch:delta"));
    let _ = detail.insert("branchId".into(), json!(branch_id));
    let _ = detail.insert(
        "moduleId".into(),
        pick(&[(payload, "moduleId"), (frame, "moduleId")], json!(DEFAULT_MODULE)),
    );
    let _ = detail.insert(
        "action".into(),
        pick(&[(payload, "action"), (frame, "action")], json!("update")),
    );
    let _ = detail.insert("version".into(), pick(&[(payload, "version")], Value::Null));
    let _ = detail.insert(
        "mutationId".into(),
        pick(&[(payload, "mutationId"), (frame, "mutationId")], Value::Null),
    );

    if let Some(order_id) = first_truthy(frame, &["orderId", "order_id"]) {
        let _ = detail.insert("orderId".into(), order_id.clone());
    }
    if let Some(id) = frame
        .get("order")
        .filter(|o| o.is_object())
        .and_then(|o| o.get("id"))
    {
        let _ = detail.insert("orderId".into(), id.clone());
    }
    if let Some(job_id) = first_truthy(frame, &["jobId", "job_id"]) {
        let _ = detail.insert("jobId".into(), job_id.clone());
    }
    if let Some(payment_id) = first_truthy(frame, &["paymentId", "payment_id"]) {
        let _ = detail.insert("paymentId".into(), payment_id.clone());
    }
    if let Some(meta) = payload
        .get("meta")
        .filter(|m| m.is_object())
        .or_else(|| frame.get("meta").filter(|m| m.is_object()))
    {
        let _ = detail.insert("meta".into(), meta.clone());
    }
    Value::Object(detail)
}

/// Payload published on `{branch}:{suffix}`: the detail stamped with scope and time.
pub fn branch_topic_payload(branch_id: &str, suffix: &str, detail: &Value) -> Value {
    let mut payload = detail.as_object().cloned().unwrap_or_default();
    let _ = payload.insert("branchId".into(), json!(or_default(branch_id, DEFAULT_BRANCH)));
    let _ = payload.insert("topic".into(), json!(suffix));
    let _ = payload.insert("publishedAt".into(), json!(now_iso()));
    Value::Object(payload)
}
