//! WebSocket client connection state.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Who a connection says it is, set by `client:hello`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Branch the client belongs to.
    pub branch_id: Option<String>,
    /// Declared role (`cashier`, `kds`, ...).
    pub role: Option<String>,
    /// Acting user.
    pub user_uuid: Option<String>,
    /// Preferred snapshot language.
    pub lang: Option<String>,
}

/// Represents a connected WebSocket client.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: String,
    identity: RwLock<ClientIdentity>,
    /// Topics this connection subscribed to.
    topics: Mutex<HashSet<String>>,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Cancelled once the connection is closed, by either side.
    closed: CancellationToken,
    pubsub: AtomicBool,
    authenticated: AtomicBool,
    /// When this connection was established.
    pub connected_at: Instant,
    last_seen: Mutex<tokio::time::Instant>,
    /// Count of messages dropped due to full channel.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: String, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            identity: RwLock::new(ClientIdentity::default()),
            topics: Mutex::new(HashSet::new()),
            tx,
            closed: CancellationToken::new(),
            pubsub: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            connected_at: Instant::now(),
            last_seen: Mutex::new(tokio::time::Instant::now()),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Snapshot of the identity fields.
    pub fn identity(&self) -> ClientIdentity {
        self.identity.read().clone()
    }

    /// Replace the identity fields.
    pub fn set_identity(&self, identity: ClientIdentity) {
        *self.identity.write() = identity;
    }

    /// Branch set by the handshake.
    pub fn branch_id(&self) -> Option<String> {
        self.identity.read().branch_id.clone()
    }

    /// Snapshot language set by the handshake.
    pub fn lang(&self) -> Option<String> {
        self.identity.read().lang.clone()
    }

    /// Acting user, if known.
    pub fn user_uuid(&self) -> Option<String> {
        self.identity.read().user_uuid.clone()
    }

    /// Record the acting user.
    pub fn set_user_uuid(&self, user: String) {
        self.identity.write().user_uuid = Some(user);
    }

    /// Track a topic subscription.
    pub fn add_topic(&self, topic: &str) {
        let _ = self.topics.lock().insert(topic.to_owned());
    }

    /// Subscribed topics.
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().iter().cloned().collect()
    }

    /// Forget every topic subscription, returning how many there were.
    pub fn clear_topics(&self) -> usize {
        let mut topics = self.topics.lock();
        let count = topics.len();
        topics.clear();
        count
    }

    /// Mark the connection as speaking the pub/sub protocol.
    pub fn mark_pubsub(&self) {
        self.pubsub.store(true, Ordering::Relaxed);
    }

    /// Whether a pub/sub frame was seen.
    pub fn is_pubsub(&self) -> bool {
        self.pubsub.load(Ordering::Relaxed)
    }

    /// Record a pub/sub `auth`.
    pub fn authenticate(&self) {
        self.authenticated.store(true, Ordering::Relaxed);
    }

    /// Whether the client sent a pub/sub `auth`.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Close the connection; further sends fail.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the connection is still open.
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Token cancelled when the connection closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Send a text message to the client.
    ///
    /// Returns `false` if the connection is closed or the channel is full or
    /// closed; the latter two increment the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if !self.is_open() {
            return false;
        }
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Serialize a JSON value and send it to the client.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Record that the client just sent something.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = tokio::time::Instant::now();
    }

    /// Time since the client last sent anything, or since it connected.
    pub fn silent_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection() -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new("conn_1".into(), tx);
        (conn, rx)
    }

    #[test]
    fn create_connection() {
        let (conn, _rx) = make_connection();
        assert_eq!(conn.id, "conn_1");
        assert!(conn.branch_id().is_none());
        assert!(conn.is_open());
        assert!(!conn.is_pubsub());
        assert!(!conn.is_authenticated());
        assert!(conn.silent_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn send_message_success() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send(Arc::new("hello".into())));
        let msg = rx.recv().await.unwrap();
        assert_eq!(&*msg, "hello");
    }

    #[tokio::test]
    async fn send_to_closed_channel_counts_drop() {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new("conn_2".into(), tx);
        drop(rx);
        assert!(!conn.send(Arc::new("hello".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_to_full_channel_returns_false() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new("conn_3".into(), tx);
        assert!(conn.send(Arc::new("msg1".into())));
        assert!(!conn.send(Arc::new("msg2".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[test]
    fn closed_connection_refuses_sends_without_counting() {
        let (conn, _rx) = make_connection();
        let token = conn.closed_token();
        conn.close();
        assert!(!conn.is_open());
        assert!(token.is_cancelled());
        assert!(!conn.send(Arc::new("late".into())));
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn identity_round_trip() {
        let (conn, _rx) = make_connection();
        conn.set_identity(ClientIdentity {
            branch_id: Some("b1".into()),
            role: Some("cashier".into()),
            user_uuid: None,
            lang: Some("ar".into()),
        });
        conn.set_user_uuid("u1".into());
        assert_eq!(conn.branch_id().as_deref(), Some("b1"));
        assert_eq!(conn.lang().as_deref(), Some("ar"));
        assert_eq!(conn.user_uuid().as_deref(), Some("u1"));
        assert_eq!(conn.identity().role.as_deref(), Some("cashier"));
    }

    #[test]
    fn topics_are_tracked_once() {
        let (conn, _rx) = make_connection();
        conn.add_topic("t1");
        conn.add_topic("t1");
        conn.add_topic("t2");
        assert_eq!(conn.topics().len(), 2);
        assert_eq!(conn.clear_topics(), 2);
        assert!(conn.topics().is_empty());
    }

    #[test]
    fn protocol_flags() {
        let (conn, _rx) = make_connection();
        conn.mark_pubsub();
        conn.authenticate();
        assert!(conn.is_pubsub());
        assert!(conn.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn mark_alive_resets_silence() {
        let (conn, _rx) = make_connection();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(conn.silent_for() >= Duration::from_secs(5));
        conn.mark_alive();
        assert_eq!(conn.silent_for(), Duration::ZERO);
    }

    #[tokio::test]
    async fn send_json_serializes() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send_json(&serde_json::json!({"key": "value"})));
        let msg = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["key"], "value");
    }

    #[test]
    fn connection_age_increases() {
        let (conn, _rx) = make_connection();
        let age1 = conn.age();
        std::thread::sleep(Duration::from_millis(10));
        assert!(conn.age() > age1);
    }
}
