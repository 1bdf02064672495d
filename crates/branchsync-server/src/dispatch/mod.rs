//! Inbound frame dispatch.
//!
//! [`Dispatcher`] owns the collaborators a frame handler needs and routes
//! each parsed [`InboundFrame`] to the branch protocol or the pub/sub
//! protocol. Handler failures become `error` frames on the offending
//! connection; nothing a client sends can end its session.

mod branch;
mod broker;
pub mod frames;
mod pubsub;

use std::collections::HashMap;
use std::sync::Arc;

use branchsync_core::store::{AuditLog, ModuleStorage, OrderProcessor, RejectedMutation};
use branchsync_engine::{FlagOptions, FullSyncFlag, SyncEngine};
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use frames::{FrameError, InboundFrame};

use crate::metrics::{WS_ERROR_FRAMES_TOTAL, WS_INBOUND_FRAMES_TOTAL};
use crate::websocket::clients::SessionManager;
use crate::websocket::connection::ClientConnection;

/// Routes inbound frames and owns the shared gateway state.
pub struct Dispatcher {
    engine: Arc<SyncEngine>,
    sessions: Arc<SessionManager>,
    audit: Arc<dyn AuditLog>,
    orders: Arc<dyn OrderProcessor>,
    default_branch: String,
    sequences: Mutex<HashMap<(String, String), u64>>,
}

impl Dispatcher {
    /// Wire a dispatcher.
    pub fn new(
        engine: Arc<SyncEngine>,
        sessions: Arc<SessionManager>,
        audit: Arc<dyn AuditLog>,
        orders: Arc<dyn OrderProcessor>,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            sessions,
            audit,
            orders,
            default_branch: default_branch.into(),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// The sync engine.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// The session registry.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    fn storage(&self) -> &Arc<dyn ModuleStorage> {
        self.engine.state.storage()
    }

    /// Parse and handle one text frame.
    pub async fn handle_text(&self, conn: &Arc<ClientConnection>, text: &str) {
        let result = match InboundFrame::parse(text) {
            Ok(frame) => {
                counter!(WS_INBOUND_FRAMES_TOTAL, "type" => frame.kind()).increment(1);
                self.route(conn, frame).await
            }
            Err(error) => Err(error),
        };
        if let Err(error) = result {
            self.send_error(conn, &error);
        }
    }

    async fn route(&self, conn: &Arc<ClientConnection>, frame: InboundFrame) -> Result<(), FrameError> {
        if frame.is_pubsub() {
            return self.handle_pubsub(conn, frame).await;
        }
        match frame {
            InboundFrame::Hello(hello) => self.hello(conn, hello).await,
            InboundFrame::RequestSnapshot { request_id } => {
                self.send_snapshot(conn, "explicit-request", request_id).await;
            }
            InboundFrame::RequestHistory { request_id } => {
                self.send_snapshot(conn, "history-request", request_id).await;
            }
            InboundFrame::ClientPublish(publish) => self.client_publish(conn, publish).await?,
            InboundFrame::Query(query) => self.client_query(conn, query).await?,
            InboundFrame::Unknown(kind) => {
                return Err(FrameError::new(
                    frames::UNSUPPORTED_FRAME,
                    format!("Unsupported frame type \"{}\"", kind.unwrap_or_default()),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    fn send_error(&self, conn: &ClientConnection, error: &FrameError) {
        counter!(WS_ERROR_FRAMES_TOTAL, "code" => error.code).increment(1);
        debug!(conn_id = %conn.id, code = error.code, message = %error.message, "sending error frame");
        let _ = self.sessions.send_to_client(conn, error.to_frame());
    }

    async fn audit(&self, branch_id: &str, module_id: &str, record: RejectedMutation) {
        let reason = record.reason.clone();
        if let Err(e) = self.audit.log_rejected_mutation(branch_id, module_id, record).await {
            warn!(branch_id, module_id, reason, error = %e, "failed to record rejected mutation");
        }
    }

    fn next_sequence(&self, branch_id: &str, module_id: &str) -> u64 {
        let mut sequences = self.sequences.lock();
        let counter = sequences
            .entry((branch_id.to_owned(), module_id.to_owned()))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    /// Enable or disable a full-sync flag and announce the change to the branch.
    ///
    /// Returns the flag, or `None` when disabling a flag that does not exist.
    pub fn set_full_sync_flag(
        &self,
        branch_id: &str,
        module_id: &str,
        enabled: bool,
        options: FlagOptions,
    ) -> Option<FullSyncFlag> {
        let flag = if enabled {
            Some(self.engine.flags.enable(branch_id, module_id, options))
        } else {
            self.engine.flags.disable(branch_id, module_id, options)
        }?;
        let reached = self.sessions.emit_full_sync_directive(&flag);
        info!(
            branch_id = %flag.branch_id,
            module_id = %flag.module_id,
            enabled = flag.enabled,
            reached,
            "full-sync flag updated"
        );
        Some(flag)
    }

    /// Drop a connection from every topic and from the session registry.
    pub fn disconnect(&self, conn_id: &str) -> Option<Arc<ClientConnection>> {
        let topics = self.engine.topics.unsubscribe(conn_id);
        let conn = self.sessions.unregister(conn_id);
        if let Some(conn) = &conn {
            let _ = conn.clear_topics();
        }
        debug!(conn_id, topics, "connection cleaned up");
        conn
    }
}
