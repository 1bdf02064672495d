//! Audit log implementations.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use crate::errors::AuditError;
use crate::store::{AuditLog, RejectedMutation};

/// Emits each rejected mutation as a structured `warn` event.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn log_rejected_mutation(
        &self,
        branch_id: &str,
        module_id: &str,
        record: RejectedMutation,
    ) -> Result<(), AuditError> {
        warn!(
            branch_id,
            module_id,
            reason = %record.reason,
            source = %record.source,
            trans_id = record.trans_id.as_deref(),
            mutation_id = record.mutation_id.as_deref(),
            meta = %record.meta,
            "rejected mutation"
        );
        Ok(())
    }
}

/// Keeps rejected mutations in memory, tagged with branch and module.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<(String, String, RejectedMutation)>>,
}

impl MemoryAuditLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub fn records(&self) -> Vec<(String, String, RejectedMutation)> {
        self.records.lock().clone()
    }

    /// Records with the given reason.
    pub fn with_reason(&self, reason: &str) -> Vec<RejectedMutation> {
        self.records
            .lock()
            .iter()
            .filter(|(_, _, r)| r.reason == reason)
            .map(|(_, _, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn log_rejected_mutation(
        &self,
        branch_id: &str,
        module_id: &str,
        record: RejectedMutation,
    ) -> Result<(), AuditError> {
        self.records
            .lock()
            .push((branch_id.to_owned(), module_id.to_owned(), record));
        Ok(())
    }
}
