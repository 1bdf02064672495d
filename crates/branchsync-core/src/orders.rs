//! Point-of-sale order persistence on top of module storage.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::OrderError;
use crate::json::{key_part, now_millis};
use crate::store::{ModuleStorage, MutationAction, MutationContext, OrderOutcome, OrderProcessor};

/// Table orders are written to by default.
pub const ORDER_TABLE: &str = "order_header";

/// Upserts orders into a module table.
pub struct TableOrderProcessor {
    storage: Arc<dyn ModuleStorage>,
    table: String,
}

impl TableOrderProcessor {
    /// Write orders to [`ORDER_TABLE`].
    pub fn new(storage: Arc<dyn ModuleStorage>) -> Self {
        Self::with_table(storage, ORDER_TABLE)
    }

    /// Write orders to a custom table.
    pub fn with_table(storage: Arc<dyn ModuleStorage>, table: impl Into<String>) -> Self {
        Self {
            storage,
            table: table.into(),
        }
    }
}

#[async_trait]
impl OrderProcessor for TableOrderProcessor {
    async fn process_order(
        &self,
        branch_id: &str,
        module_id: &str,
        order: &Value,
        context: &MutationContext,
    ) -> Result<OrderOutcome, OrderError> {
        let Some(fields) = order.as_object() else {
            return Err(OrderError::InvalidOrder);
        };
        let id = fields
            .get("id")
            .and_then(key_part)
            .filter(|id| !id.trim().is_empty())
            .ok_or(OrderError::MissingId)?;

        let store = self.storage.ensure_module_store(branch_id, module_id).await?;
        let existing = store.get_record(&self.table, &id)?.is_some();

        let mut record = fields.clone();
        let _ = record.insert("savedAt".into(), Value::from(now_millis()));
        let outcome = store.apply_mutation(
            &self.table,
            MutationAction::Save,
            &Value::Object(record),
            context,
        )?;
        if let Err(e) = self.storage.persist_module_store(store.as_ref()).await {
            warn!(branch_id, module_id, order_id = %id, error = %e, "failed to persist order");
            return Err(e.into());
        }
        debug!(branch_id, module_id, order_id = %id, existing, "order persisted");

        Ok(OrderOutcome {
            order: outcome.record.unwrap_or_else(|| order.clone()),
            existing,
        })
    }
}
