//! Priority tiers, pipeline events, and the viewer wire envelope.
//!
//! Three layers:
//!
//! - **Inputs**: [`StatusEvent`] (agent status / progress) and [`DecisionEvent`]
//!   arrive from the scheduler or the ingress API.
//! - **Queue items**: [`QueuedEvent`] is what a session queue holds between
//!   enqueue and flush.
//! - **Output**: [`ChannelEvent`] is the JSON envelope published to every
//!   viewer subscribed to a session.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::agents::AgentStatus;

/// Event `type` strings seen by viewers.
pub mod event_types {
    /// One agent status change.
    pub const AGENT_STATUS_UPDATE: &str = "agent-status-update";
    /// Several status events of one tier, flushed together.
    pub const AGENT_STATUS_BATCH: &str = "agent-status-batch";
    /// Session-wide aggregate progress.
    pub const SESSION_PROGRESS: &str = "session-progress";
    /// A critical/high decision, delivered immediately.
    pub const DECISION_CREATED: &str = "decision-created";
    /// Medium decisions, rendered in a sidebar.
    pub const DECISION_BATCH: &str = "decision-batch";
    /// Low decisions, applied to client state without UI.
    pub const DECISION_SILENT: &str = "decision-silent";
    /// A single decision was acknowledged.
    pub const DECISION_READ: &str = "decision-read";
    /// Every decision in the session was acknowledged.
    pub const ALL_DECISIONS_READ: &str = "all-decisions-read";
    /// A caller operation was rejected by a rate limiter.
    pub const RATE_LIMITED: &str = "rate-limited";
}

// ─────────────────────────────────────────────────────────────────────────────
// PriorityTier / NotificationRoute
// ─────────────────────────────────────────────────────────────────────────────

/// Delivery priority. Declaration order is flush order (critical first).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    /// Published immediately, never queued.
    Critical,
    /// ≤300–500 ms added delay.
    High,
    /// ≤500–1000 ms added delay.
    Medium,
    /// ≤1000–2000 ms added delay.
    Low,
}

impl PriorityTier {
    /// All tiers, most urgent first.
    pub const ALL: [Self; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Whether items of this tier skip the session queue.
    pub fn bypasses_queue(self) -> bool {
        self == Self::Critical
    }

    /// Client surface a decision of this importance should use.
    pub fn route(self) -> NotificationRoute {
        match self {
            Self::Critical | Self::High => NotificationRoute::Toast,
            Self::Medium => NotificationRoute::Sidebar,
            Self::Low => NotificationRoute::Silent,
        }
    }

    /// Lowercase name, as used on the wire and in metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a viewer's client is expected to surface a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationRoute {
    /// Pop-up notification.
    Toast,
    /// Listed in the sidebar.
    Sidebar,
    /// State update only.
    Silent,
}

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

/// A status-tier payload waiting to be classified and delivered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    /// Viewer event type (defaults to `agent-status-update`).
    #[serde(rename = "type", default = "default_status_type")]
    pub event_type: String,
    /// Event body.
    #[serde(default)]
    pub payload: Value,
    /// Logical time of the underlying change; used for latency accounting.
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

fn default_status_type() -> String {
    event_types::AGENT_STATUS_UPDATE.to_string()
}

impl StatusEvent {
    /// Status update for one agent.
    pub fn agent_status(status: &AgentStatus) -> Self {
        Self {
            event_type: event_types::AGENT_STATUS_UPDATE.to_string(),
            payload: json!(status),
            occurred_at: status.updated_at,
        }
    }

    /// Session-wide aggregate progress (0–100).
    pub fn progress(progress: f64) -> Self {
        Self {
            event_type: event_types::SESSION_PROGRESS.to_string(),
            payload: json!({ "progress": progress }),
            occurred_at: Utc::now(),
        }
    }

    /// Wrap several status events into one batch-shaped event.
    ///
    /// The batch's logical time is the oldest member's, so latency is never
    /// under-reported.
    pub fn batch(events: Vec<StatusEvent>) -> Self {
        let occurred_at = events
            .iter()
            .map(|e| e.occurred_at)
            .min()
            .unwrap_or_else(Utc::now);
        let count = events.len();
        let events: Vec<Value> = events
            .into_iter()
            .map(|e| {
                json!({
                    "type": e.event_type,
                    "data": e.payload,
                    "timestamp": format_timestamp(e.occurred_at),
                })
            })
            .collect();
        Self {
            event_type: event_types::AGENT_STATUS_BATCH.to_string(),
            payload: json!({ "count": count, "events": events }),
            occurred_at,
        }
    }
}

/// A decision record produced by an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEvent {
    /// Decision ID.
    pub id: String,
    /// Agent that made the decision.
    pub agent: String,
    /// One-line summary.
    pub summary: String,
    /// Longer rationale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Importance; selects both latency and [`NotificationRoute`].
    pub importance: PriorityTier,
    /// When the decision was recorded.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl DecisionEvent {
    /// Viewer-facing JSON, including the notification route.
    pub fn to_payload(&self) -> Value {
        json!({
            "id": self.id,
            "agent": self.agent,
            "summary": self.summary,
            "detail": self.detail,
            "importance": self.importance,
            "route": self.importance.route(),
            "createdAt": self.created_at,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue item
// ─────────────────────────────────────────────────────────────────────────────

/// An event held in a session queue until the next flush.
#[derive(Clone, Debug)]
pub struct QueuedEvent {
    /// Owning session.
    pub session_id: String,
    /// Viewer event type.
    pub event_type: String,
    /// Event body.
    pub payload: Value,
    /// Tier the event was classified into.
    pub priority: PriorityTier,
    /// When the event entered the queue.
    pub enqueued_at: Instant,
    /// Logical time of the underlying change.
    pub occurred_at: DateTime<Utc>,
}

impl QueuedEvent {
    /// Classify a status event for `session_id`.
    pub fn new(session_id: &str, event: StatusEvent, priority: PriorityTier) -> Self {
        Self {
            session_id: session_id.to_string(),
            event_type: event.event_type,
            payload: event.payload,
            priority,
            enqueued_at: Instant::now(),
            occurred_at: event.occurred_at,
        }
    }

    /// Entry used inside a batch event's `events` list.
    pub fn to_batch_entry(&self) -> Value {
        json!({
            "type": self.event_type,
            "data": self.payload,
            "timestamp": format_timestamp(self.occurred_at),
        })
    }

    /// Whether this item already wraps several events.
    pub fn is_batch(&self) -> bool {
        self.event_type == event_types::AGENT_STATUS_BATCH
    }

    /// Entries this item contributes to a batch event.
    ///
    /// A wrapped batch contributes its members, so batches never nest.
    pub fn batch_entries(&self) -> Vec<Value> {
        if !self.is_batch() {
            return vec![self.to_batch_entry()];
        }
        self.payload
            .get("events")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Event envelope published to a session's viewers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEvent {
    /// Event type (see [`event_types`]).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Session the event belongs to.
    pub session_id: String,
    /// Publish time, RFC 3339 with milliseconds.
    pub timestamp: String,
    /// Event body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Observed end-to-end latency in milliseconds (immediate deliveries only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<u64>,
}

impl ChannelEvent {
    /// Build an envelope stamped with the current time.
    pub fn new(event_type: impl Into<String>, session_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            session_id: session_id.into(),
            timestamp: format_timestamp(Utc::now()),
            data: Some(data),
            latency: None,
        }
    }

    /// Attach an observed latency.
    #[must_use]
    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency = Some(latency_ms);
        self
    }
}

/// Milliseconds elapsed since `since`, clamped at zero for clock skew.
pub fn elapsed_ms(since: DateTime<Utc>) -> u64 {
    (Utc::now() - since).num_milliseconds().max(0) as u64
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
