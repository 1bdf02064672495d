//! Server configuration.

use branchsync_settings::SyncSettings;
use serde::{Deserialize, Serialize};

/// Configuration for the gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat timeout in seconds (close after this many seconds without a pong).
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Dropped frames tolerated before a connection is closed.
    pub max_dropped_messages: u64,
    /// Branch assigned on a hello that names none.
    pub default_branch: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 50,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            outbound_buffer: 1024,
            max_dropped_messages: 256,
            default_branch: "lab:test-pad".into(),
        }
    }
}

impl ServerConfig {
    /// Server configuration carried by loaded settings.
    pub fn from_settings(settings: &SyncSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            heartbeat_interval_secs: server.heartbeat_interval_secs,
            heartbeat_timeout_secs: server.heartbeat_timeout_secs,
            max_message_size: server.max_message_size,
            outbound_buffer: server.outbound_buffer.max(1),
            max_dropped_messages: server.max_dropped_messages,
            default_branch: settings.sync.default_branch.clone(),
        }
    }
}
