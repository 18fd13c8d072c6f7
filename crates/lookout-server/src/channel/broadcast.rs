//! Event fan-out to connected viewers, grouped into per-session rooms.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use lookout_core::events::ChannelEvent;
use metrics::{counter, gauge};
use tracing::{debug, warn};

use super::connection::ClientConnection;
use super::{ChannelError, SessionChannel};
use crate::metrics::{EVENTS_PUBLISHED_TOTAL, WS_BROADCAST_DROPS_TOTAL, WS_CONNECTIONS_ACTIVE};

/// Maximum total lifetime message drops before forcibly disconnecting a slow client.
const MAX_TOTAL_DROPS: u64 = 100;

/// Connection registry plus one room per watched session.
///
/// Rooms are keyed by session ID, so publishing to one session never touches
/// another session's subscribers.
pub struct BroadcastManager {
    /// Connected viewers indexed by connection ID.
    connections: DashMap<String, Arc<ClientConnection>>,
    /// Session ID → subscribed connections (by connection ID).
    rooms: DashMap<String, HashMap<String, Arc<ClientConnection>>>,
}

impl BroadcastManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
        }
    }

    /// Register a connection. A connection with the same ID is replaced.
    pub fn add(&self, connection: Arc<ClientConnection>) {
        if let Some(previous) = self.connections.insert(connection.id.clone(), connection) {
            self.leave_all(&previous);
            previous.close();
        }
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.connections.len() as f64);
    }

    /// Remove a connection, drop it from every room and close it.
    ///
    /// The connection keeps its own subscription list, so callers can still
    /// see which sessions it was watching.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        let (_, conn) = self.connections.remove(connection_id)?;
        self.leave_all(&conn);
        conn.close();
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.connections.len() as f64);
        Some(conn)
    }

    /// Subscribe a connection to a session's room.
    ///
    /// Returns `None` for an unknown connection, otherwise whether this
    /// viewer is the room's first.
    pub fn join(&self, connection_id: &str, session_id: &str) -> Option<bool> {
        let conn = self.connections.get(connection_id)?.value().clone();
        let _ = conn.subscribe(session_id);
        let mut room = self.rooms.entry(session_id.to_string()).or_default();
        let first = room.is_empty();
        let _ = room.insert(conn.id.clone(), Arc::clone(&conn));
        Some(first)
    }

    /// Unsubscribe a connection from a session's room.
    ///
    /// Returns `None` when the connection was not subscribed, otherwise
    /// whether the room is now empty.
    pub fn leave(&self, connection_id: &str, session_id: &str) -> Option<bool> {
        let was_member = {
            let mut room = self.rooms.get_mut(session_id)?;
            room.remove(connection_id).is_some()
        };
        if let Some(conn) = self.connections.get(connection_id) {
            let _ = conn.unsubscribe(session_id);
        }
        if !was_member {
            return None;
        }
        let _ = self.rooms.remove_if(session_id, |_, room| room.is_empty());
        Some(!self.has_subscribers(session_id))
    }

    fn leave_all(&self, conn: &ClientConnection) {
        for session_id in conn.sessions() {
            if let Some(mut room) = self.rooms.get_mut(&session_id) {
                let _ = room.remove(&conn.id);
            }
            let _ = self.rooms.remove_if(&session_id, |_, room| room.is_empty());
        }
    }

    /// Number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of viewers subscribed to a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.rooms.get(session_id).map_or(0, |room| room.len())
    }

    /// Look up a connection.
    pub fn get(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.get(connection_id).map(|c| c.value().clone())
    }

    /// Connections subscribed to a session.
    pub fn session_connections(&self, session_id: &str) -> Vec<Arc<ClientConnection>> {
        self.rooms
            .get(session_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for BroadcastManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionChannel for BroadcastManager {
    /// Serialize once, fan out to the room, disconnect persistently slow clients.
    fn publish(&self, session_id: &str, event: &ChannelEvent) -> Result<usize, ChannelError> {
        let json = Arc::new(serde_json::to_string(event)?);
        // Clone the recipient list so no room guard is held while sending.
        let recipients = self.session_connections(session_id);

        let mut to_remove = Vec::new();
        for conn in &recipients {
            if !conn.send(Arc::clone(&json)) {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                let drops = conn.drop_count();
                if drops >= MAX_TOTAL_DROPS {
                    warn!(conn_id = %conn.id, session_id, drops, "disconnecting slow client");
                    to_remove.push(conn.id.clone());
                } else {
                    warn!(conn_id = %conn.id, session_id, total_drops = drops, "failed to send event to client (channel full)");
                }
            }
        }
        for id in &to_remove {
            let _ = self.remove(id);
        }

        counter!(EVENTS_PUBLISHED_TOTAL, "type" => event.event_type.clone()).increment(1);
        debug!(
            event_type = %event.event_type,
            session_id,
            recipients = recipients.len(),
            "published event"
        );
        Ok(recipients.len())
    }

    fn has_subscribers(&self, session_id: &str) -> bool {
        self.rooms.get(session_id).is_some_and(|room| !room.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn make_connection_with_rx(id: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Arc::new(ClientConnection::new(id.into(), "127.0.0.1".into(), tx)),
            rx,
        )
    }

    fn make_event(event_type: &str, session_id: &str) -> ChannelEvent {
        ChannelEvent::new(event_type, session_id, json!({"n": 1}))
    }

    #[test]
    fn add_and_remove_connection() {
        let bm = BroadcastManager::new();
        let (conn, _rx) = make_connection_with_rx("c1");
        bm.add(conn);
        assert_eq!(bm.connection_count(), 1);
        assert!(bm.remove("c1").is_some());
        assert_eq!(bm.connection_count(), 0);
        assert!(bm.remove("c1").is_none());
    }

    #[test]
    fn join_reports_first_viewer() {
        let bm = BroadcastManager::new();
        let (c1, _rx1) = make_connection_with_rx("c1");
        let (c2, _rx2) = make_connection_with_rx("c2");
        bm.add(c1);
        bm.add(c2);
        assert_eq!(bm.join("c1", "sess_a"), Some(true));
        assert_eq!(bm.join("c2", "sess_a"), Some(false));
        assert_eq!(bm.subscriber_count("sess_a"), 2);
        assert_eq!(bm.join("ghost", "sess_a"), None);
    }

    #[test]
    fn leave_reports_last_viewer() {
        let bm = BroadcastManager::new();
        let (c1, _rx1) = make_connection_with_rx("c1");
        let (c2, _rx2) = make_connection_with_rx("c2");
        bm.add(c1);
        bm.add(c2);
        let _ = bm.join("c1", "s");
        let _ = bm.join("c2", "s");
        assert_eq!(bm.leave("c1", "s"), Some(false));
        assert_eq!(bm.leave("c1", "s"), None);
        assert_eq!(bm.leave("c2", "s"), Some(true));
        assert!(!bm.has_subscribers("s"));
    }

    #[test]
    fn has_subscribers_tracks_rooms() {
        let bm = BroadcastManager::new();
        assert!(!bm.has_subscribers("s"));
        let (c1, _rx) = make_connection_with_rx("c1");
        bm.add(c1);
        assert!(!bm.has_subscribers("s"));
        let _ = bm.join("c1", "s");
        assert!(bm.has_subscribers("s"));
        let _ = bm.remove("c1");
        assert!(!bm.has_subscribers("s"));
    }

    #[test]
    fn removed_connection_keeps_its_subscription_list() {
        let bm = BroadcastManager::new();
        let (c1, _rx) = make_connection_with_rx("c1");
        bm.add(c1);
        let _ = bm.join("c1", "a");
        let _ = bm.join("c1", "b");
        let conn = bm.remove("c1").unwrap();
        let mut sessions = conn.sessions();
        sessions.sort();
        assert_eq!(sessions, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(bm.subscriber_count("a"), 0);
    }

    #[test]
    fn publish_reaches_only_room_members() {
        let bm = BroadcastManager::new();
        let (c1, mut rx1) = make_connection_with_rx("c1");
        let (c2, mut rx2) = make_connection_with_rx("c2");
        let (c3, mut rx3) = make_connection_with_rx("c3");
        bm.add(c1);
        bm.add(c2);
        bm.add(c3);
        let _ = bm.join("c1", "sess_a");
        let _ = bm.join("c2", "sess_b");
        let _ = bm.join("c3", "sess_a");

        let sent = bm.publish("sess_a", &make_event("agent-status-update", "sess_a")).unwrap();
        assert_eq!(sent, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx3.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn publish_to_empty_room_is_ok() {
        let bm = BroadcastManager::new();
        let sent = bm.publish("nobody", &make_event("x", "nobody")).unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn published_frame_is_valid_json() {
        let bm = BroadcastManager::new();
        let (c1, mut rx) = make_connection_with_rx("c1");
        bm.add(c1);
        let _ = bm.join("c1", "sess_a");

        let event = ChannelEvent::new("decision-created", "sess_a", json!({"id": "d1"}))
            .with_latency(7);
        let _ = bm.publish("sess_a", &event).unwrap();

        let msg = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "decision-created");
        assert_eq!(parsed["sessionId"], "sess_a");
        assert_eq!(parsed["data"]["id"], "d1");
        assert_eq!(parsed["latency"], 7);
    }

    #[tokio::test]
    async fn publish_shares_one_serialized_frame() {
        let bm = BroadcastManager::new();
        let (c1, mut rx1) = make_connection_with_rx("c1");
        let (c2, mut rx2) = make_connection_with_rx("c2");
        bm.add(c1);
        bm.add(c2);
        let _ = bm.join("c1", "s");
        let _ = bm.join("c2", "s");

        let _ = bm.publish("s", &make_event("x", "s")).unwrap();
        let m1 = rx1.recv().await.unwrap();
        let m2 = rx2.recv().await.unwrap();
        assert!(Arc::ptr_eq(&m1, &m2));
    }

    #[test]
    fn slow_client_disconnected_after_threshold() {
        let bm = BroadcastManager::new();
        let (tx, _rx) = mpsc::channel(1);
        let slow = Arc::new(ClientConnection::new("slow".into(), "1.1.1.1".into(), tx));
        let (fast, mut fast_rx) = make_connection_with_rx("fast");
        bm.add(Arc::clone(&slow));
        bm.add(fast);
        let _ = bm.join("slow", "s");
        let _ = bm.join("fast", "s");

        let event = make_event("x", "s");
        // First publish fills the slow client's buffer, the rest are drops.
        for _ in 0..=MAX_TOTAL_DROPS {
            let _ = bm.publish("s", &event).unwrap();
            while fast_rx.try_recv().is_ok() {}
        }

        assert_eq!(bm.connection_count(), 1);
        assert_eq!(bm.subscriber_count("s"), 1);
        assert!(bm.get("fast").is_some());
        assert!(slow.is_closed());
        assert_eq!(slow.sessions(), vec!["s".to_string()]);
    }

    #[test]
    fn re_adding_same_id_replaces_connection() {
        let bm = BroadcastManager::new();
        let (c1, _rx1) = make_connection_with_rx("same");
        bm.add(Arc::clone(&c1));
        let _ = bm.join("same", "a");
        let (c2, _rx2) = make_connection_with_rx("same");
        bm.add(Arc::clone(&c2));
        assert_eq!(bm.connection_count(), 1);
        assert_eq!(bm.subscriber_count("a"), 0);
        assert!(c1.is_closed());
        assert!(!c2.is_closed());
    }
}
