//! Viewer connection state.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A connected viewer.
///
/// Transport-agnostic: the WebSocket write task drains `tx`'s receiver.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: String,
    /// Caller identity used for per-address rate limits (usually the remote IP).
    pub remote: String,
    /// Sessions this viewer is subscribed to.
    sessions: Mutex<HashSet<String>>,
    /// Send channel to the client's write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Count of messages dropped due to a full or closed channel.
    dropped_messages: AtomicU64,
    /// Cancelled once the connection leaves the registry.
    closed: CancellationToken,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: String, remote: String, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            remote,
            sessions: Mutex::new(HashSet::new()),
            tx,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Record a subscription. Returns `false` if already subscribed.
    pub(crate) fn subscribe(&self, session_id: &str) -> bool {
        self.sessions.lock().insert(session_id.to_string())
    }

    /// Drop a subscription. Returns `false` if not subscribed.
    pub(crate) fn unsubscribe(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id)
    }

    /// Whether this viewer watches `session_id`.
    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.sessions.lock().contains(session_id)
    }

    /// Snapshot of subscribed sessions.
    pub fn sessions(&self) -> Vec<String> {
        self.sessions.lock().iter().cloned().collect()
    }

    /// Queue a text frame for the client.
    ///
    /// Never blocks. Returns `false` if the channel is full or closed, and
    /// increments the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize a JSON value and queue it.
    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Tell the transport to hang up. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}
