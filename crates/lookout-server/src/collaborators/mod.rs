//! Seams to the external service layer.
//!
//! The pipeline never reads storage directly. Agent status, progress and
//! archival eligibility come from an [`AgentStatusSource`]; cold storage is
//! delegated to a [`SessionArchiver`]. [`HttpServiceClient`] implements both
//! against the service layer's HTTP API.

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lookout_core::agents::{AgentStatus, SessionSummary};
use thiserror::Error;

pub use http::HttpServiceClient;

/// Errors from a collaborator call. Callers treat every variant as
/// "nothing to do this time".
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The configured base URL cannot address session resources.
    #[error("invalid base url {0}")]
    InvalidUrl(String),
    /// Transport failure or timeout.
    #[error("request failed: {0}")]
    Transport(String),
    /// The service answered with an unexpected status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// The response body did not match the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Read-side queries about sessions and their agents.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentStatusSource: Send + Sync {
    /// Latest status of one agent role in a session, if it has one.
    async fn current_status(
        &self,
        session_id: &str,
        agent: &str,
    ) -> Result<Option<AgentStatus>, CollaboratorError>;

    /// Aggregate session progress (0–100), if known.
    async fn session_progress(&self, session_id: &str) -> Result<Option<f64>, CollaboratorError>;

    /// Sessions eligible for cold storage that ended before `cutoff`.
    async fn archivable_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionSummary>, CollaboratorError>;
}

/// Cold-storage side effects.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionArchiver: Send + Sync {
    /// Write a session's data to `archive_path`.
    async fn archive(&self, session_id: &str, archive_path: &str) -> Result<(), CollaboratorError>;

    /// Record that a session now lives at `archive_path`.
    async fn mark_archived(
        &self,
        session_id: &str,
        archive_path: &str,
    ) -> Result<(), CollaboratorError>;
}
