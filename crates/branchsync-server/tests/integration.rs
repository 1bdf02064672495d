//! End-to-end tests using a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use branchsync_core::audit::MemoryAuditLog;
use branchsync_core::memory::MemoryStorage;
use branchsync_core::orders::TableOrderProcessor;
use branchsync_core::store::{ModuleSchema, ModuleStorage, TableDefinition};
use branchsync_engine::{EngineConfig, SyncEngine};
use branchsync_server::config::ServerConfig;
use branchsync_server::dispatch::Dispatcher;
use branchsync_server::server::SyncServer;
use branchsync_server::websocket::clients::SessionManager;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    url: String,
    server: Arc<SyncServer>,
    audit: Arc<MemoryAuditLog>,
}

fn pos_schema() -> ModuleSchema {
    ModuleSchema {
        module_id: "pos".into(),
        tables: vec![
            TableDefinition::keyed_by_id("order_header"),
            TableDefinition::keyed_by_id("order_payment"),
        ],
    }
}

/// Boot a gateway on an ephemeral port.
async fn boot_server(config: ServerConfig) -> TestServer {
    let storage: Arc<dyn ModuleStorage> = Arc::new(MemoryStorage::new(vec![pos_schema()], "ws-it"));
    let engine = Arc::new(SyncEngine::new(
        storage.clone(),
        EngineConfig {
            server_id: "ws-it".into(),
            ..EngineConfig::default()
        },
    ));
    let sessions = Arc::new(SessionManager::new("ws-it", config.max_dropped_messages));
    let audit = Arc::new(MemoryAuditLog::new());
    let dispatcher = Arc::new(Dispatcher::new(
        engine,
        sessions,
        audit.clone(),
        Arc::new(TableOrderProcessor::new(storage)),
        config.default_branch.clone(),
    ));
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .build_recorder()
        .handle();
    let server = Arc::new(SyncServer::new(config, dispatcher).with_metrics(metrics_handle));
    let (addr, _handle) = server.listen().await.unwrap();
    TestServer {
        url: format!("ws://{addr}/ws"),
        server,
        audit,
    }
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Connect and consume the `connection.established` frame.
async fn connect_ready(url: &str) -> (WsStream, String) {
    let mut ws = connect(url).await;
    let hello = read_json(&mut ws).await;
    assert_eq!(hello["type"], "connection.established");
    let id = hello["data"]["clientId"].as_str().unwrap().to_owned();
    (ws, id)
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read until a frame of `kind` arrives.
async fn read_until(ws: &mut WsStream, kind: &str) -> Value {
    loop {
        let frame = read_json(ws).await;
        if frame["type"] == kind {
            return frame;
        }
    }
}

/// Assert nothing arrives for a short while.
async fn assert_quiet(ws: &mut WsStream) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(QUIET, ws.next()).await {
        panic!("unexpected frame: {text}");
    }
}

async fn send_json(ws: &mut WsStream, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn hello(ws: &mut WsStream, branch: &str) -> Value {
    send_json(ws, json!({"type": "client:hello", "branchId": branch, "role": "cashier"})).await;
    let log = read_json(ws).await;
    assert_eq!(log["type"], "server:log");
    read_json(ws).await
}

#[tokio::test]
async fn connection_established_carries_client_id() {
    let ts = boot_server(ServerConfig::default()).await;
    let (_ws, id) = connect_ready(&ts.url).await;
    assert!(id.starts_with("conn_"));
    assert_eq!(ts.server.dispatcher().sessions().connection_count(), 1);
}

#[tokio::test]
async fn hello_returns_branch_snapshot() {
    let ts = boot_server(ServerConfig::default()).await;
    let (mut ws, _) = connect_ready(&ts.url).await;
    let snapshot = hello(&mut ws, "b1").await;
    assert_eq!(snapshot["type"], "server:snapshot");
    assert_eq!(snapshot["branchId"], "b1");
    assert_eq!(snapshot["meta"]["reason"], "initial-sync");
    assert_eq!(snapshot["meta"]["serverId"], "ws-it");
    assert!(snapshot["modules"]["pos"]["tables"]["order_header"].is_array());
}

#[tokio::test]
async fn invalid_json_keeps_session_open() {
    let ts = boot_server(ServerConfig::default()).await;
    let (mut ws, _) = connect_ready(&ts.url).await;
    ws.send(Message::Text("{broken".to_owned().into())).await.unwrap();
    let error = read_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "invalid-json");

    send_json(&mut ws, json!({"type": "ping"})).await;
    assert_eq!(read_json(&mut ws).await, json!({"type": "pong"}));
}

#[tokio::test]
async fn sync_publish_reaches_subscriber_and_replay_is_deduplicated() {
    let ts = boot_server(ServerConfig::default()).await;
    let (mut watcher, _) = connect_ready(&ts.url).await;
    let (mut publisher, _) = connect_ready(&ts.url).await;

    send_json(&mut watcher, json!({"type": "subscribe", "topic": "sync:b1:pos"})).await;
    let ack = read_json(&mut watcher).await;
    assert_eq!(ack, json!({"type": "ack", "event": "subscribe", "topic": "sync:b1:pos"}));
    let replay = read_json(&mut watcher).await;
    assert_eq!(replay["data"]["mode"], "snapshot");
    assert_eq!(replay["data"]["snapshot"]["moduleId"], "pos");

    let publish = json!({
        "type": "publish",
        "topic": "sync:b1:pos",
        "data": {"trans_id": "t-1", "mutationId": "m-1", "action": "update", "note": "first"}
    });
    send_json(&mut publisher, publish.clone()).await;
    let delta = read_json(&mut watcher).await;
    assert_eq!(delta["type"], "publish");
    assert_eq!(delta["data"]["mode"], "delta");
    assert_eq!(delta["data"]["set"]["mutationId"], "m-1");
    assert_eq!(delta["data"]["set"]["note"], "first");

    send_json(&mut publisher, publish).await;
    let dup = read_json(&mut publisher).await;
    assert_eq!(dup["type"], "publish");
    assert_eq!(dup["data"]["meta"]["duplicateTrans"], true);
    assert_eq!(dup["data"]["meta"]["transId"], "t-1");
    assert_quiet(&mut watcher).await;
    assert_eq!(ts.audit.with_reason("duplicate-trans-id").len(), 1);
}

#[tokio::test]
async fn sync_publish_without_trans_id_is_rejected() {
    let ts = boot_server(ServerConfig::default()).await;
    let (mut ws, _) = connect_ready(&ts.url).await;
    send_json(&mut ws, json!({"type": "publish", "topic": "sync:b1:pos", "data": {"note": "x"}})).await;
    let error = read_json(&mut ws).await;
    assert_eq!(error["code"], "missing-trans-id");
    assert_eq!(error["message"], "Publish frames must include a trans_id.");
}

#[tokio::test]
async fn client_publish_acks_sender_and_notifies_branch() {
    let ts = boot_server(ServerConfig::default()).await;
    let (mut cashier, _) = connect_ready(&ts.url).await;
    let (mut kds, _) = connect_ready(&ts.url).await;
    let _ = hello(&mut cashier, "b1").await;
    let _ = hello(&mut kds, "b1").await;

    send_json(&mut kds, json!({"type": "subscribe", "topic": "table:b1::order_header"})).await;
    let _ = read_until(&mut kds, "ack").await;

    send_json(&mut cashier, json!({
        "type": "client:publish",
        "moduleId": "pos",
        "table": "order_header",
        "record": {"id": "o-1", "total": 42}
    }))
    .await;

    let ack = read_until(&mut cashier, "server:ack").await;
    assert_eq!(ack["table"], "order_header");
    assert_eq!(ack["record"]["total"], 42);
    assert_eq!(ack["sequence"], 1);

    let event = read_until(&mut kds, "server:event").await;
    assert_eq!(event["eventId"], ack["eventId"]);
    let notice = read_until(&mut kds, "publish").await;
    assert_eq!(notice["topic"], "table:b1::order_header");
    assert_eq!(notice["data"]["snapshot"]["type"], "table:update");
    assert_eq!(notice["data"]["snapshot"]["recordRef"]["id"], "o-1");
}

#[tokio::test]
async fn query_returns_rows() {
    let ts = boot_server(ServerConfig::default()).await;
    let (mut ws, _) = connect_ready(&ts.url).await;
    let _ = hello(&mut ws, "b1").await;
    send_json(&mut ws, json!({
        "type": "client:publish", "moduleId": "pos", "table": "order_header", "record": {"id": "o-7"}
    }))
    .await;
    let _ = read_until(&mut ws, "server:ack").await;

    send_json(&mut ws, json!({
        "type": "client:query", "requestId": "q-1", "moduleId": "pos", "table": "order_header"
    }))
    .await;
    let result = read_until(&mut ws, "server:query:result").await;
    assert_eq!(result["requestId"], "q-1");
    assert_eq!(result["result"][0]["id"], "o-7");
}

#[tokio::test]
async fn connection_limit_refuses_upgrade() {
    let ts = boot_server(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    })
    .await;
    let (_first, _) = connect_ready(&ts.url).await;
    match connect_async(&ts.url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("second connection should be refused"),
    }
}

#[tokio::test]
async fn disconnect_releases_session() {
    let ts = boot_server(ServerConfig::default()).await;
    let (mut ws, _) = connect_ready(&ts.url).await;
    send_json(&mut ws, json!({"type": "subscribe", "topic": "chat"})).await;
    let _ = read_json(&mut ws).await;
    ws.close(None).await.unwrap();

    let sessions = ts.server.dispatcher().sessions().clone();
    let released = timeout(TIMEOUT, async {
        while sessions.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(released.is_ok());
    assert_eq!(ts.server.dispatcher().engine().topics.topic_count(), 0);
}

#[tokio::test]
async fn silent_client_is_evicted() {
    let ts = boot_server(ServerConfig {
        heartbeat_interval_secs: 1,
        heartbeat_timeout_secs: 1,
        ..ServerConfig::default()
    })
    .await;
    // Never read, so the client never answers pings.
    let _ws = connect(&ts.url).await;

    let sessions = ts.server.dispatcher().sessions().clone();
    let registered = timeout(TIMEOUT, async {
        while sessions.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(registered.is_ok());

    let evicted = timeout(TIMEOUT, async {
        while sessions.connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(evicted.is_ok());
}

#[tokio::test]
async fn shutdown_closes_sessions() {
    let ts = boot_server(ServerConfig::default()).await;
    let (mut ws, _) = connect_ready(&ts.url).await;
    ts.server.shutdown().trigger();
    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}
