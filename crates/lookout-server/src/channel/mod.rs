//! Delivery channel: "publish to every viewer of session X".
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `connection` | Per-viewer outbox, subscriptions, drop accounting |
//! | `broadcast` | Connection registry, per-session rooms, fan-out |
//!
//! Pipeline components depend only on the [`SessionChannel`] trait, so tests
//! substitute a recording fake.

pub mod broadcast;
pub mod connection;

use lookout_core::events::ChannelEvent;
use metrics::counter;
use thiserror::Error;
use tracing::warn;

use crate::metrics::PUBLISH_ERRORS_TOTAL;

pub use broadcast::BroadcastManager;
pub use connection::ClientConnection;

/// Errors raised at the transport boundary.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The event could not be serialized.
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The transport refused the publish.
    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

/// Append-only, per-session broadcast primitive shared by the scheduler,
/// emitter and router. Implementations must tolerate concurrent publishes.
pub trait SessionChannel: Send + Sync {
    /// Deliver `event` to every subscriber of `session_id`.
    ///
    /// Returns the number of subscribers the event was handed to.
    fn publish(&self, session_id: &str, event: &ChannelEvent) -> Result<usize, ChannelError>;

    /// Whether at least one viewer is subscribed. Must be O(1).
    fn has_subscribers(&self, session_id: &str) -> bool;
}

/// Publish and swallow the error after logging it. Delivery is at-most-once.
pub(crate) fn publish_logged(
    channel: &dyn SessionChannel,
    session_id: &str,
    event: &ChannelEvent,
    component: &'static str,
) -> bool {
    match channel.publish(session_id, event) {
        Ok(_) => true,
        Err(e) => {
            counter!(PUBLISH_ERRORS_TOTAL, "component" => component).increment(1);
            warn!(session_id, component, event_type = %event.event_type, error = %e, "publish failed");
            false
        }
    }
}
