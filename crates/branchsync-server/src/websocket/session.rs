//! WebSocket session lifecycle: one connected client from upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::heartbeat::{Heartbeat, Pulse};
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::dispatch::frames::connection_established;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// How long the outbound forwarder gets to flush and send a close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection and sends `connection.established`
/// 2. Forwards queued outbound frames and sends periodic Ping frames
/// 3. Dispatches inbound text (and UTF-8 binary) frames
/// 4. Ends on client close, heartbeat timeout, slow-consumer close, or server shutdown
/// 5. Releases topic subscriptions and session membership
#[instrument(skip_all, fields(conn_id = %conn_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    conn_id: String,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(config.outbound_buffer.max(1));
    let connection = Arc::new(ClientConnection::new(conn_id.clone(), send_tx));
    let started = Instant::now();

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    dispatcher.sessions().register(connection.clone());

    if let Ok(json) = serde_json::to_string(&connection_established(&conn_id)) {
        let _ = ws_tx.send(Message::Text(json.into())).await;
    }

    let heartbeat = Heartbeat::from_config(&config);
    let closed = connection.closed_token();

    let outbound_closed = closed.clone();
    let outbound_conn = connection.clone();
    let mut outbound = tokio::spawn(async move {
        let mut ping_ticker = heartbeat.ticker();
        loop {
            tokio::select! {
                biased;
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_closed.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                _ = ping_ticker.tick() => match heartbeat.pulse(&outbound_conn) {
                    Pulse::Ping => {
                        if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                    Pulse::Evict { silent_for } => {
                        warn!(?silent_for, timeout = ?heartbeat.timeout(), "client unresponsive, disconnecting");
                        outbound_conn.close();
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                },
            }
        }
    });

    loop {
        tokio::select! {
            () = closed.cancelled() => {
                debug!("connection closed by server");
                break;
            }
            () = shutdown.cancelled() => {
                info!("server shutting down, closing client");
                break;
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(t) => t.to_string(),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => {
                            debug!(len = data.len(), "ignored non-UTF8 binary frame");
                            continue;
                        }
                    },
                    Message::Ping(_) | Message::Pong(_) => {
                        connection.mark_alive();
                        continue;
                    }
                    Message::Close(_) => {
                        info!("client sent close frame");
                        break;
                    }
                };
                connection.mark_alive();
                dispatcher.handle_text(&connection, &text).await;
            }
        }
    }

    let _ = dispatcher.disconnect(&conn_id);
    connection.close();
    if tokio::time::timeout(CLOSE_GRACE, &mut outbound).await.is_err() {
        outbound.abort();
    }

    info!(
        dropped = connection.drop_count(),
        secs = started.elapsed().as_secs_f64(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}
