//! Live connections and branch membership.
//!
//! [`SessionManager`] owns every [`ClientConnection`] and the branch index.
//! All outbound traffic goes through [`SessionManager::deliver`], which
//! counts failed sends and closes connections that keep dropping frames.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use branchsync_core::json::now_iso;
use branchsync_engine::FullSyncFlag;
use metrics::counter;
use parking_lot::RwLock;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::connection::ClientConnection;
use super::cycle::{BroadcastCycle, CHANNEL_BRANCH, CHANNEL_DIRECT};
use crate::metrics::{
    WS_FRAMES_DELIVERED_TOTAL, WS_SEND_FAILURES_TOTAL, WS_SLOW_CONSUMER_CLOSES_TOTAL,
    record_broadcast,
};

/// Registry of connected clients.
pub struct SessionManager {
    connections: RwLock<HashMap<String, Arc<ClientConnection>>>,
    branches: RwLock<HashMap<String, HashSet<String>>>,
    server_id: String,
    max_dropped_messages: u64,
}

impl SessionManager {
    /// Create a manager stamping `server_id` on log frames.
    pub fn new(server_id: impl Into<String>, max_dropped_messages: u64) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            branches: RwLock::new(HashMap::new()),
            server_id: server_id.into(),
            max_dropped_messages,
        }
    }

    /// Index a connection by id, and by branch when it has one.
    pub fn register(&self, connection: Arc<ClientConnection>) {
        let branch = connection.branch_id();
        let id = connection.id.clone();
        let _ = self.connections.write().insert(id.clone(), connection);
        if let Some(branch) = branch {
            self.index_branch(&id, &branch);
        }
    }

    /// Move a connection into `branch`'s membership set.
    pub fn assign_branch(&self, conn_id: &str, branch_id: &str) {
        self.drop_from_branches(conn_id);
        self.index_branch(conn_id, branch_id);
    }

    fn index_branch(&self, conn_id: &str, branch_id: &str) {
        let _ = self
            .branches
            .write()
            .entry(branch_id.to_owned())
            .or_default()
            .insert(conn_id.to_owned());
    }

    fn drop_from_branches(&self, conn_id: &str) {
        self.branches.write().retain(|_, members| {
            let _ = members.remove(conn_id);
            !members.is_empty()
        });
    }

    /// Forget a connection and close it.
    pub fn unregister(&self, conn_id: &str) -> Option<Arc<ClientConnection>> {
        let removed = self.connections.write().remove(conn_id);
        self.drop_from_branches(conn_id);
        if let Some(conn) = &removed {
            conn.close();
        }
        removed
    }

    /// Connection by id.
    pub fn get(&self, conn_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.read().get(conn_id).cloned()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Number of branches with at least one connection.
    pub fn branch_count(&self) -> usize {
        self.branches.read().len()
    }

    /// Connections of a branch.
    pub fn branch_connections(&self, branch_id: &str) -> Vec<Arc<ClientConnection>> {
        let Some(ids) = self.branches.read().get(branch_id).cloned() else {
            return Vec::new();
        };
        let connections = self.connections.read();
        ids.iter().filter_map(|id| connections.get(id).cloned()).collect()
    }

    /// Hand the cycle's frame to one connection.
    ///
    /// A failed send is logged and counted; once the connection's drop count
    /// exceeds the configured limit it is closed.
    pub fn deliver(&self, conn: &ClientConnection, cycle: &BroadcastCycle) -> bool {
        let Some(payload) = cycle.payload() else {
            return false;
        };
        if conn.send(payload) {
            counter!(WS_FRAMES_DELIVERED_TOTAL, "channel" => cycle.channel()).increment(1);
            return true;
        }
        counter!(WS_SEND_FAILURES_TOTAL, "channel" => cycle.channel()).increment(1);
        if !conn.is_open() {
            debug!(conn_id = %conn.id, "skipped closed connection");
            return false;
        }
        let drops = conn.drop_count();
        warn!(conn_id = %conn.id, channel = cycle.channel(), drops, "failed to send frame to client");
        if drops > self.max_dropped_messages {
            warn!(conn_id = %conn.id, drops, "closing slow consumer");
            counter!(WS_SLOW_CONSUMER_CLOSES_TOTAL).increment(1);
            conn.close();
        }
        false
    }

    /// Send a frame to one connection.
    pub fn send_to_client(&self, conn: &ClientConnection, frame: Value) -> bool {
        self.deliver(conn, &BroadcastCycle::new(frame, CHANNEL_DIRECT))
    }

    /// Deliver one cycle to the listed connection ids, skipping unknown ones.
    ///
    /// Returns the number of connections reached.
    pub fn send_to_ids(&self, ids: &[String], cycle: &BroadcastCycle) -> usize {
        let targets: Vec<_> = {
            let connections = self.connections.read();
            ids.iter().filter_map(|id| connections.get(id).cloned()).collect()
        };
        targets
            .iter()
            .filter(|conn| self.deliver(conn, cycle))
            .count()
    }

    /// Send a frame to every connection of a branch.
    pub fn broadcast_to_branch(&self, branch_id: &str, frame: Value) -> usize {
        let cycle = BroadcastCycle::new(frame, CHANNEL_BRANCH);
        let delivered = self
            .branch_connections(branch_id)
            .iter()
            .filter(|conn| self.deliver(conn, &cycle))
            .count();
        record_broadcast(CHANNEL_BRANCH, delivered);
        delivered
    }

    /// Announce a full-sync flag to its branch.
    pub fn emit_full_sync_directive(&self, flag: &FullSyncFlag) -> usize {
        self.broadcast_to_branch(&flag.branch_id, flag.directive_frame())
    }

    /// Send a `server:log` frame.
    pub fn send_server_log(&self, conn: &ClientConnection, level: &str, message: &str, context: Value) -> bool {
        self.send_to_client(
            conn,
            json!({
                "type": "server:log",
                "level": level,
                "message": message,
                "context": context,
                "ts": now_iso(),
                "serverId": self.server_id,
            }),
        )
    }

    /// Server id stamped on frames.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }
}
