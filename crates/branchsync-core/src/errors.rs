//! Error types for the collaborators the sync core depends on.

use thiserror::Error;

/// Failures raised by module storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No schema is registered for the module.
    #[error("unknown module: {branch_id}/{module_id}")]
    ModuleNotFound {
        /// Branch the lookup targeted.
        branch_id: String,
        /// Module the lookup targeted.
        module_id: String,
    },
    /// The module does not declare the table.
    #[error("unknown table: {0}")]
    TableNotFound(String),
    /// No row matches the supplied key.
    #[error("record not found in {table}: {key}")]
    RecordNotFound {
        /// Table searched.
        table: String,
        /// Key searched for.
        key: String,
    },
    /// A row with the same primary key already exists.
    #[error("duplicate record in {table}: {key}")]
    DuplicateRecord {
        /// Table written to.
        table: String,
        /// Conflicting key.
        key: String,
    },
    /// The record payload is malformed.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// The mutation action is not recognised.
    #[error("unsupported module action: {0}")]
    UnsupportedAction(String),
    /// Disk access failed.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted snapshot could not be encoded or decoded.
    #[error("storage json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures raised by the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The audit sink refused the record.
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

/// Failures raised while persisting an order.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The order payload has no usable `id`.
    #[error("Order must have an id")]
    MissingId,
    /// The order payload is not an object.
    #[error("Order must be an object")]
    InvalidOrder,
    /// The underlying storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
