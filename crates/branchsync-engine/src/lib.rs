//! # branchsync-engine
//!
//! The synchronization core:
//!
//! - [`state`]: versioned per-`(branch, module)` state and the insert-only apply gate
//! - [`dedup`]: bounded transaction history for at-most-once application
//! - [`full_sync`]: full-sync directive flags
//! - [`topics`]: topic registry with snapshot/delta diffing ([`envelope`])
//! - [`payload`]: sync topic payload assembly
//! - [`naming`] and [`tables`]: topic names and table aliases
//!
//! [`SyncEngine`] bundles the registries so the server can share them behind
//! one `Arc`.

#![deny(unsafe_code)]

pub mod dedup;
pub mod envelope;
pub mod errors;
pub mod full_sync;
pub mod insert_only;
pub mod naming;
pub mod payload;
pub mod state;
pub mod tables;
pub mod topics;

use std::sync::Arc;

use branchsync_core::store::ModuleStorage;
use serde_json::Value;

pub use dedup::{TransRecord, TransactionTracker};
pub use errors::{SyncError, Violation, ViolationReason};
pub use full_sync::{FlagFilter, FlagOptions, FullSyncFlag, FullSyncRegistry};
pub use payload::{PublishOverrides, SyncPayloadBuilder};
pub use state::{ApplyContext, StateStore, SyncState};
pub use topics::{PublishOutcome, TopicRegistry};

/// Tunables of the engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Identifier stamped on payloads.
    pub server_id: String,
    /// Transactions remembered per `(branch, module)`.
    pub trans_history_limit: usize,
    /// Mutation ids remembered per transaction.
    pub trans_mutation_history_limit: usize,
    /// Tables `*` expands to in transaction table lists.
    pub default_transaction_tables: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_id: "ws-local".to_string(),
            trans_history_limit: 50,
            trans_mutation_history_limit: 20,
            default_transaction_tables: ["order_header", "order_line", "order_payment", "pos_shift"]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// The registries of one gateway instance.
pub struct SyncEngine {
    /// Engine tunables.
    pub config: EngineConfig,
    /// Versioned module state.
    pub state: Arc<StateStore>,
    /// Transaction history.
    pub dedup: Arc<TransactionTracker>,
    /// Full-sync flags.
    pub flags: Arc<FullSyncRegistry>,
    /// Sync payload assembly.
    pub payloads: Arc<SyncPayloadBuilder>,
    /// Topic registry.
    pub topics: Arc<TopicRegistry>,
}

impl SyncEngine {
    /// Wire the registries over a storage collaborator.
    pub fn new(storage: Arc<dyn ModuleStorage>, config: EngineConfig) -> Self {
        let state = Arc::new(StateStore::new(storage, config.server_id.clone()));
        let dedup = Arc::new(TransactionTracker::new(
            config.trans_history_limit,
            config.trans_mutation_history_limit,
        ));
        let flags = Arc::new(FullSyncRegistry::new());
        let payloads = Arc::new(SyncPayloadBuilder::new(flags.clone(), config.server_id.clone()));
        let topics = Arc::new(TopicRegistry::new(state.clone(), payloads.clone()));
        Self {
            config,
            state,
            dedup,
            flags,
            payloads,
            topics,
        }
    }

    /// Identifier stamped on payloads.
    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// Resolve a loose transaction table list against the configured defaults.
    pub fn transaction_tables(&self, input: &Value) -> Vec<String> {
        tables::normalize_transaction_table_list(input, &self.config.default_transaction_tables, true)
    }
}
