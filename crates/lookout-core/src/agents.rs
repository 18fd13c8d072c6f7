//! Agent and session records observed from the external service layer.
//!
//! The pipeline never owns this state. It reads it through the collaborator
//! traits and relays it to viewers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single agent inside a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Not started yet.
    Pending,
    /// Currently working.
    InProgress,
    /// Failed at least once and trying again.
    Retrying,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Not run for this session.
    Skipped,
}

impl AgentState {
    /// Whether the agent is doing work viewers should see live.
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Retrying)
    }
}

/// Snapshot of one agent's state in a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// Agent role name (e.g. `"planner"`).
    pub agent: String,
    /// Current state.
    pub state: AgentState,
    /// Latest human-readable thought or step description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Agent-local progress percentage (0–100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// When the service layer last saw this state change.
    pub updated_at: DateTime<Utc>,
}

/// Final (or current) outcome of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Still running.
    Running,
    /// Every agent completed.
    Success,
    /// Finished with some agents failed or skipped.
    PartialSuccess,
    /// Finished without a usable result.
    Failed,
    /// Stopped by a user.
    Cancelled,
}

impl SessionOutcome {
    /// Whether a session with this outcome may be moved to cold storage.
    pub fn is_archivable(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }
}

/// Summary row returned when listing sessions for archival.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session ID.
    pub session_id: String,
    /// Session outcome.
    pub outcome: SessionOutcome,
    /// When the session ended (`None` while running).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionSummary {
    /// Whether this session ended successfully before `cutoff`.
    pub fn eligible_for_archive(&self, cutoff: DateTime<Utc>) -> bool {
        self.outcome.is_archivable() && self.ended_at.is_some_and(|ended| ended < cutoff)
    }
}
