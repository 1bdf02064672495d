//! # branchsync-core
//!
//! Foundation types shared by every branchsync crate:
//!
//! - Branded ID newtypes ([`ids`])
//! - Error taxonomy for the storage, audit, and order collaborators ([`errors`])
//! - JSON and timestamp helpers ([`json`])
//! - `tracing` subscriber setup ([`logging`])
//! - Collaborator contracts consumed by the sync engine ([`store`])
//! - Reference collaborator implementations ([`memory`], [`audit`], [`orders`])

#![deny(unsafe_code)]

pub mod audit;
pub mod errors;
pub mod ids;
pub mod json;
pub mod logging;
pub mod memory;
pub mod orders;
pub mod store;

pub use errors::{AuditError, OrderError, StorageError};
pub use ids::{ConnectionId, EventId};
pub use store::{
    AuditLog, FieldDefinition, ModuleSchema, ModuleSnapshot, ModuleStorage, ModuleStore,
    MutationAction, MutationContext, MutationOutcome, OrderOutcome, OrderProcessor,
    RejectedMutation, TableDefinition,
};
