//! Table name aliasing.
//!
//! Clients and historical payloads refer to the same table under several
//! names. The lookup tables here are built once and map every known alias to
//! its canonical name, and every canonical name back to its alias group.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::Value;

const TRANSACTION_ALIASES: &[(&str, &str)] = &[
    ("order_header", "order_header"),
    ("orders", "order_header"),
    ("order", "order_header"),
    ("order_headers", "order_header"),
    ("orderheader", "order_header"),
    ("order_line", "order_line"),
    ("order_lines", "order_line"),
    ("orders_lines", "order_line"),
    ("orderline", "order_line"),
    ("orderlines", "order_line"),
    ("line_items", "order_line"),
    ("payments", "order_payment"),
    ("payment", "order_payment"),
    ("order_payments", "order_payment"),
    ("pos_payments", "order_payment"),
    ("pos_payment", "order_payment"),
    ("pos_shift", "pos_shift"),
    ("pos_shifts", "pos_shift"),
    ("shifts", "pos_shift"),
    ("shift", "pos_shift"),
];

const ALIAS_GROUPS: &[(&str, &[&str])] = &[
    ("order_header", &["order_header", "orders", "orderHeader"]),
    ("order_line", &["order_line", "order_lines", "orderLine"]),
    ("order_payment", &["order_payment", "order_payments", "payments", "orderPayment"]),
    ("order_delivery", &["order_delivery", "deliveries", "order_deliveries", "orderDelivery"]),
    ("job_order_batch", &["job_order_batch", "job_order_batches", "batches", "jobOrderBatch"]),
    ("job_order_header", &["job_order_header", "job_orders", "job_order_headers", "jobOrderHeader"]),
    ("job_order_detail", &["job_order_detail", "job_order_details", "jobOrderDetail"]),
    ("job_order_detail_modifier", &["job_order_detail_modifier", "jobOrderDetailModifier"]),
    ("job_order_status_history", &["job_order_status_history", "jobOrderStatusHistory"]),
];

struct AliasIndex {
    transaction: HashMap<String, &'static str>,
    groups_by_alias: HashMap<String, &'static [&'static str]>,
}

fn index() -> &'static AliasIndex {
    static INDEX: OnceLock<AliasIndex> = OnceLock::new();
    INDEX.get_or_init(|| AliasIndex {
        transaction: TRANSACTION_ALIASES
            .iter()
            .map(|(alias, target)| (normalize_table_identifier(alias), *target))
            .collect(),
        groups_by_alias: ALIAS_GROUPS
            .iter()
            .flat_map(|(_, group)| group.iter().map(move |alias| (alias.to_lowercase(), *group)))
            .collect(),
    })
}

/// Lowercase, collapse runs of non-alphanumerics to `_`, trim `_`.
pub fn normalize_table_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Canonical transaction table of `input`, or the trimmed input when unknown.
pub fn resolve_transaction_table_name(input: &str) -> Option<String> {
    let normalized = normalize_table_identifier(input);
    if normalized.is_empty() {
        return None;
    }
    Some(
        index()
            .transaction
            .get(&normalized)
            .map_or_else(|| input.trim().to_owned(), |t| (*t).to_owned()),
    )
}

/// Resolve a loose list of transaction tables.
///
/// Accepts an array, a comma/semicolon/whitespace separated string, or an
/// object whose values are names. `*` pulls in `defaults`, as does an input
/// naming nothing when `fallback_to_defaults` is set. Duplicates are dropped.
pub fn normalize_transaction_table_list(
    input: &Value,
    defaults: &[String],
    fallback_to_defaults: bool,
) -> Vec<String> {
    let raw: Vec<String> = match input {
        Value::Array(items) => items.iter().filter_map(scalar_name).collect(),
        Value::String(s) => s
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .map(str::to_owned)
            .collect(),
        Value::Object(map) => map.values().filter_map(scalar_name).collect(),
        _ => Vec::new(),
    };

    let mut values: Vec<String> = Vec::new();
    let mut include_defaults = false;
    let mut saw_explicit = false;
    for entry in raw {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        saw_explicit = true;
        if trimmed == "*" {
            include_defaults = true;
            continue;
        }
        if let Some(name) = resolve_transaction_table_name(trimmed) {
            if !values.contains(&name) {
                values.push(name);
            }
        }
    }

    if fallback_to_defaults && (!saw_explicit || values.is_empty()) {
        include_defaults = true;
    }
    if include_defaults {
        for table in defaults {
            if !values.contains(table) {
                values.push(table.clone());
            }
        }
    }
    values
}

fn scalar_name(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Every alias of the group `table` belongs to, or just `table` itself.
pub fn all_table_names(table: &str) -> Vec<String> {
    index()
        .groups_by_alias
        .get(&table.to_lowercase())
        .map_or_else(
            || vec![table.to_owned()],
            |group| group.iter().map(|s| (*s).to_owned()).collect(),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> Vec<String> {
        ["order_header", "order_line", "order_payment", "pos_shift"]
            .map(String::from)
            .to_vec()
    }

    #[test]
    fn identifier_normalization() {
        assert_eq!(normalize_table_identifier("  Order-Lines "), "order_lines");
        assert_eq!(normalize_table_identifier("__pos  payments__"), "pos_payments");
        assert_eq!(normalize_table_identifier("orderHeader"), "orderheader");
        assert_eq!(normalize_table_identifier("--"), "");
    }

    #[test]
    fn transaction_aliases_resolve() {
        assert_eq!(resolve_transaction_table_name("Orders").as_deref(), Some("order_header"));
        assert_eq!(resolve_transaction_table_name("line items").as_deref(), Some("order_line"));
        assert_eq!(resolve_transaction_table_name("POS-Payment").as_deref(), Some("order_payment"));
        assert_eq!(resolve_transaction_table_name(" shifts ").as_deref(), Some("pos_shift"));
        assert_eq!(resolve_transaction_table_name(" Custom ").as_deref(), Some("Custom"));
        assert_eq!(resolve_transaction_table_name("  "), None);
    }

    #[test]
    fn table_list_from_string() {
        let tables = normalize_transaction_table_list(&json!("orders, payments;orders shift"), &defaults(), true);
        assert_eq!(tables, vec!["order_header", "order_payment", "pos_shift"]);
    }

    #[test]
    fn table_list_wildcard_adds_defaults() {
        let tables = normalize_transaction_table_list(&json!(["custom", "*"]), &defaults(), false);
        assert_eq!(
            tables,
            vec!["custom", "order_header", "order_line", "order_payment", "pos_shift"]
        );
    }

    #[test]
    fn empty_input_falls_back_to_defaults() {
        assert_eq!(normalize_transaction_table_list(&Value::Null, &defaults(), true), defaults());
        assert!(normalize_transaction_table_list(&Value::Null, &defaults(), false).is_empty());
    }

    #[test]
    fn table_list_from_object_values() {
        let tables = normalize_transaction_table_list(&json!({"a": "order", "b": "order_header"}), &defaults(), false);
        assert_eq!(tables, vec!["order_header"]);
    }

    #[test]
    fn alias_groups() {
        assert_eq!(all_table_names("Orders"), vec!["order_header", "orders", "orderHeader"]);
        assert_eq!(all_table_names("jobOrderDetailModifier").len(), 2);
        assert_eq!(all_table_names("pos_shift"), vec!["pos_shift"]);
    }
}
