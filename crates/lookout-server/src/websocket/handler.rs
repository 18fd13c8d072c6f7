//! Viewer frame dispatch: parses one inbound text frame and applies it.

use std::time::Duration;

use lookout_core::events::event_types;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::channel::ClientConnection;
use crate::pipeline::{Pipeline, SubscriptionChange};
use crate::rate_limit::LimitDecision;

/// Frames a viewer may send.
#[derive(Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Subscribe to a session.
    Join {
        /// Session to watch.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Unsubscribe from a session.
    Leave {
        /// Session to stop watching.
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Liveness check.
    Ping,
}

/// Handle one inbound frame and build the reply for the viewer.
///
/// Every frame passes the message limiter first; join and leave also pass
/// the subscription limiter. Denials come back as `rate-limited` replies.
#[instrument(skip_all, fields(conn_id = %connection.id))]
pub fn handle_frame(text: &str, connection: &ClientConnection, pipeline: &Pipeline) -> Value {
    if let LimitDecision::Denied { retry_after } = pipeline.check_message(&connection.id) {
        return rate_limited("message", retry_after);
    }

    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "invalid frame received");
            return error_reply(&format!("invalid frame: {e}"));
        }
    };
    debug!(?frame, "dispatching frame");

    match frame {
        ClientFrame::Ping => json!({ "type": "pong" }),
        ClientFrame::Join { session_id } | ClientFrame::Leave { session_id }
            if session_id.trim().is_empty() =>
        {
            error_reply("sessionId must not be empty")
        }
        ClientFrame::Join { session_id } => match pipeline.join(connection, &session_id) {
            SubscriptionChange::Applied => json!({ "type": "joined", "sessionId": session_id }),
            SubscriptionChange::Unchanged => error_reply("connection is not registered"),
            SubscriptionChange::RateLimited { retry_after } => {
                rate_limited("subscription", retry_after)
            }
        },
        ClientFrame::Leave { session_id } => match pipeline.leave(connection, &session_id) {
            SubscriptionChange::Applied | SubscriptionChange::Unchanged => {
                json!({ "type": "left", "sessionId": session_id })
            }
            SubscriptionChange::RateLimited { retry_after } => {
                rate_limited("subscription", retry_after)
            }
        },
    }
}

/// `rate-limited` reply telling the viewer when to retry.
pub fn rate_limited(operation: &str, retry_after: Duration) -> Value {
    json!({
        "type": event_types::RATE_LIMITED,
        "operation": operation,
        "retryAfterMs": retry_after.as_millis() as u64,
    })
}

fn error_reply(message: &str) -> Value {
    json!({ "type": "error", "message": message })
}
