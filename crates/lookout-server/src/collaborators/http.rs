//! HTTP implementation of the collaborator traits.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use lookout_core::agents::{AgentStatus, SessionSummary};
use lookout_settings::CollaboratorSettings;
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use super::{AgentStatusSource, CollaboratorError, SessionArchiver};

/// Longest response body kept in a [`CollaboratorError::Status`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Deserialize)]
struct ProgressResponse {
    progress: Option<f64>,
}

/// Client for the service layer's session API.
#[derive(Clone)]
pub struct HttpServiceClient {
    client: reqwest::Client,
    base: Url,
}

impl HttpServiceClient {
    /// Build a client from settings.
    pub fn new(settings: &CollaboratorSettings) -> Result<Self, CollaboratorError> {
        let base = Url::parse(&settings.base_url)
            .map_err(|e| CollaboratorError::InvalidUrl(format!("{}: {e}", settings.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(CollaboratorError::InvalidUrl(settings.base_url.clone()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self { client, base })
    }

    /// `{base}/sessions/{segments...}` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            let _ = path.pop_if_empty().push("sessions").extend(segments);
        }
        url
    }

    async fn post_archive_path(
        &self,
        url: Url,
        archive_path: &str,
    ) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .post(url)
            .json(&json!({ "archivePath": archive_path }))
            .send()
            .await?;
        let _ = ensure_success(response).await?;
        Ok(())
    }
}

/// Map non-2xx responses to [`CollaboratorError::Status`].
async fn ensure_success(response: Response) -> Result<Response, CollaboratorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(MAX_ERROR_BODY)
        .collect();
    Err(CollaboratorError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl AgentStatusSource for HttpServiceClient {
    #[instrument(skip(self))]
    async fn current_status(
        &self,
        session_id: &str,
        agent: &str,
    ) -> Result<Option<AgentStatus>, CollaboratorError> {
        let url = self.url(&[session_id, "agents", agent, "status"]);
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("no status recorded");
            return Ok(None);
        }
        let status = ensure_success(response).await?.json::<AgentStatus>().await?;
        Ok(Some(status))
    }

    #[instrument(skip(self))]
    async fn session_progress(&self, session_id: &str) -> Result<Option<f64>, CollaboratorError> {
        let url = self.url(&[session_id, "progress"]);
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = ensure_success(response)
            .await?
            .json::<ProgressResponse>()
            .await?;
        Ok(body.progress)
    }

    #[instrument(skip(self))]
    async fn archivable_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionSummary>, CollaboratorError> {
        let url = self.url(&["archivable"]);
        let response = self
            .client
            .get(url)
            .query(&[("endedBefore", cutoff.to_rfc3339_opts(SecondsFormat::Secs, true))])
            .send()
            .await?;
        Ok(ensure_success(response)
            .await?
            .json::<Vec<SessionSummary>>()
            .await?)
    }
}

#[async_trait]
impl SessionArchiver for HttpServiceClient {
    #[instrument(skip(self))]
    async fn archive(&self, session_id: &str, archive_path: &str) -> Result<(), CollaboratorError> {
        self.post_archive_path(self.url(&[session_id, "archive"]), archive_path)
            .await
    }

    #[instrument(skip(self))]
    async fn mark_archived(
        &self,
        session_id: &str,
        archive_path: &str,
    ) -> Result<(), CollaboratorError> {
        self.post_archive_path(self.url(&[session_id, "archived"]), archive_path)
            .await
    }
}
