//! `SyncServer`: Axum HTTP + WebSocket gateway.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use branchsync_core::ConnectionId;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::health::{self, HealthResponse};
use crate::metrics::{WS_CONNECTIONS_REJECTED_TOTAL, render};
use crate::shutdown::{DrainOutcome, GatewayShutdown};
use crate::websocket::session::run_ws_session;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Frame dispatcher and gateway state.
    pub dispatcher: Arc<Dispatcher>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Gateway shutdown signal.
    pub shutdown: GatewayShutdown,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle backing `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The branch sync gateway.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
    shutdown: GatewayShutdown,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl SyncServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher,
            shutdown: GatewayShutdown::new(),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .route("/metrics", get(metrics_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address and the serving task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server terminated");
            }
        });
        info!(%addr, "branchsync gateway listening");
        Ok((addr, handle))
    }

    /// The frame dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The gateway shutdown signal.
    pub fn shutdown(&self) -> &GatewayShutdown {
        &self.shutdown
    }

    /// Stop accepting, close every session, and wait up to `grace` for them
    /// to disconnect.
    pub async fn drain(&self, serve: JoinHandle<()>, grace: Duration) -> DrainOutcome {
        self.shutdown
            .drain(serve, self.dispatcher.sessions(), grace)
            .await
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let sessions = state.dispatcher.sessions();
    Json(health::health_check(
        state.start_time,
        sessions.connection_count(),
        sessions.branch_count(),
        state.dispatcher.engine().topics.topic_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.as_ref().map(render).unwrap_or_default()
}

/// GET /ws: upgrade to a sync session, refusing past the connection limit.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let active = state.dispatcher.sessions().connection_count();
    if active >= state.config.max_connections {
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(active, limit = state.config.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let conn_id = ConnectionId::new().into_inner();
    let dispatcher = state.dispatcher.clone();
    let config = state.config.clone();
    let token = state.shutdown.token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, conn_id, dispatcher, config, token))
}
