//! Settings types with compiled defaults.

use branchsync_core::store::{ModuleSchema, TableDefinition};
use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Network and connection settings.
    pub server: ServerSettings,
    /// Sync engine tuning.
    pub sync: EngineSettings,
    /// Logging output.
    pub logging: LoggingSettings,
    /// Module schemas served by the reference storage.
    pub modules: Vec<ModuleSchema>,
}

/// Network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Stable server identifier stamped on outbound frames.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Seconds between heartbeat checks.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a pong before disconnecting.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Dropped frames tolerated before a connection is closed.
    pub max_dropped_messages: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3200,
            server_id: None,
            max_connections: 1000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024,
            outbound_buffer: 1024,
            max_dropped_messages: 256,
        }
    }
}

/// Sync engine tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Transactions remembered per `(branch, module)`.
    pub trans_history_limit: usize,
    /// Mutation ids remembered per transaction.
    pub trans_mutation_history_limit: usize,
    /// Branch assigned to clients whose hello names none.
    pub default_branch: String,
    /// Tables substituted for `*` in transaction table lists.
    pub default_transaction_tables: Vec<String>,
    /// Directory for JSON snapshots; in-memory only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            trans_history_limit: 50,
            trans_mutation_history_limit: 20,
            default_branch: "lab:test-pad".to_string(),
            default_transaction_tables: ["order_header", "order_line", "order_payment", "pos_shift"]
                .map(String::from)
                .to_vec(),
            data_dir: None,
        }
    }
}

/// Logging output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// The point-of-sale module shipped as the default schema.
pub fn default_modules() -> Vec<ModuleSchema> {
    vec![ModuleSchema {
        module_id: "pos".to_string(),
        tables: ["order_header", "order_line", "order_payment", "pos_shift"]
            .into_iter()
            .map(TableDefinition::keyed_by_id)
            .collect(),
    }]
}

impl SyncSettings {
    /// Module schemas, falling back to [`default_modules`] when none are configured.
    pub fn effective_modules(&self) -> Vec<ModuleSchema> {
        if self.modules.is_empty() {
            default_modules()
        } else {
            self.modules.clone()
        }
    }

    /// Configured server id, or `ws-{millis in base 36}`.
    pub fn resolve_server_id(&self) -> String {
        match self.server.server_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let millis = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
                format!("ws-{}", to_base36(millis))
            }
        }
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[usize::try_from(n % 36).unwrap_or(0)]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
