//! # branchsync
//!
//! Gateway binary: loads settings, wires storage, the sync engine, and the
//! dispatcher, then serves WebSocket clients until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use branchsync_core::audit::TracingAuditLog;
use branchsync_core::logging::init_subscriber;
use branchsync_core::memory::MemoryStorage;
use branchsync_core::orders::TableOrderProcessor;
use branchsync_core::store::ModuleStorage;
use branchsync_engine::{EngineConfig, SyncEngine};
use branchsync_server::config::ServerConfig;
use branchsync_server::dispatch::Dispatcher;
use branchsync_server::metrics::install_recorder;
use branchsync_server::server::SyncServer;
use branchsync_server::websocket::clients::SessionManager;
use branchsync_settings::{SyncSettings, load_settings_from_path, settings_path};
use clap::Parser;

/// How long in-flight sessions get to close after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Branch sync gateway.
#[derive(Parser, Debug)]
#[command(name = "branchsync", about = "Real-time branch/module table sync gateway")]
struct Cli {
    /// Settings file (defaults to `~/.branchsync/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Directory for JSON module snapshots (overrides settings).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    /// Overlay command-line flags onto loaded settings.
    fn apply(&self, settings: &mut SyncSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(dir) = &self.data_dir {
            settings.sync.data_dir = Some(dir.display().to_string());
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

fn build_server(settings: &SyncSettings) -> SyncServer {
    let server_id = settings.resolve_server_id();
    let mut storage = MemoryStorage::new(settings.effective_modules(), server_id.clone());
    if let Some(dir) = &settings.sync.data_dir {
        storage = storage.with_data_dir(dir);
    }
    let storage: Arc<dyn ModuleStorage> = Arc::new(storage);

    let engine = Arc::new(SyncEngine::new(
        storage.clone(),
        EngineConfig {
            server_id: server_id.clone(),
            trans_history_limit: settings.sync.trans_history_limit,
            trans_mutation_history_limit: settings.sync.trans_mutation_history_limit,
            default_transaction_tables: settings.sync.default_transaction_tables.clone(),
        },
    ));
    let sessions = Arc::new(SessionManager::new(
        server_id,
        settings.server.max_dropped_messages,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        engine,
        sessions,
        Arc::new(TracingAuditLog),
        Arc::new(TableOrderProcessor::new(storage)),
        settings.sync.default_branch.clone(),
    ));
    SyncServer::new(ServerConfig::from_settings(settings), dispatcher)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);

    init_subscriber(&settings.logging.level, settings.logging.json);
    let metrics_handle = install_recorder();

    let server = build_server(&settings).with_metrics(metrics_handle);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        server_id = server.dispatcher().engine().server_id(),
        modules = settings.effective_modules().len(),
        "branchsync listening on ws://{addr}/ws"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let outcome = server.drain(handle, SHUTDOWN_GRACE).await;
    tracing::info!(?outcome, "Shutdown complete");
    Ok(())
}
