//! Session activity scheduler.
//!
//! Owns the watched-session set and three background loops sharing one
//! cancellation token:
//!
//! - **High-priority tick**: polls the high-priority roles of every watched
//!   session that has viewers, emits active statuses at `high`, then one
//!   `session-progress` event.
//! - **Low-priority tick**: same for the low-priority roles at `low`, without
//!   the aggregate.
//! - **Archival sweep**: once a day at the configured UTC time, moves
//!   successful sessions past retention to cold storage.
//!
//! Lookup failures are logged and counted; they never end a tick or a loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use dashmap::DashSet;
use futures::future::join_all;
use lookout_core::agents::{AgentState, AgentStatus};
use lookout_core::events::{PriorityTier, StatusEvent};
use lookout_settings::{ArchivalSettings, SchedulerSettings};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::channel::SessionChannel;
use crate::collaborators::{AgentStatusSource, CollaboratorError, SessionArchiver};
use crate::emitter::StatusEmitter;
use crate::metrics::{
    LOOKUP_ERRORS_TOTAL, SCHEDULER_SKIPPED_SESSIONS_TOTAL, SCHEDULER_TICKS_TOTAL,
    SESSIONS_ARCHIVED_TOTAL, WATCHED_SESSIONS,
};

// ─────────────────────────────────────────────────────────────────────────────
// Archival results
// ─────────────────────────────────────────────────────────────────────────────

/// One session that could not be archived.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivalFailure {
    /// Session ID.
    pub session_id: String,
    /// What went wrong.
    pub error: String,
}

/// Outcome of one archival pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivalReport {
    /// Sessions archived and marked.
    pub archived: Vec<String>,
    /// Listed sessions that were not eligible and were left alone.
    pub skipped: usize,
    /// Sessions that failed.
    pub failed: Vec<ArchivalFailure>,
}

/// Manual archival errors.
#[derive(Debug, Error)]
pub enum ArchivalError {
    /// Eligible sessions could not be listed.
    #[error("failed to list archivable sessions: {0}")]
    Listing(#[source] CollaboratorError),
    /// Every session was attempted, some failed.
    #[error("{} of {} sessions failed to archive", .0.failed.len(), .0.failed.len() + .0.archived.len())]
    Partial(ArchivalReport),
}

/// Storage path for a session's archive: `<dir>/<session_id>.json.gz`.
pub fn archive_path(archive_dir: &str, session_id: &str) -> String {
    let file = format!("{}.json.gz", session_id.replace(['/', '\\'], "_"));
    Path::new(archive_dir).join(file).to_string_lossy().into_owned()
}

/// Time from `now` until the next occurrence of `at` (UTC).
pub fn next_sweep_delay(now: DateTime<Utc>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let next = if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cadence {
    High,
    Low,
}

impl Cadence {
    fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

/// Polls watched sessions and runs the daily archival sweep.
pub struct SessionScheduler {
    watched: DashSet<String>,
    channel: Arc<dyn SessionChannel>,
    emitter: Arc<StatusEmitter>,
    source: Arc<dyn AgentStatusSource>,
    archiver: Arc<dyn SessionArchiver>,
    settings: SchedulerSettings,
    archival: ArchivalSettings,
    running: Mutex<Option<CancellationToken>>,
}

impl SessionScheduler {
    /// Create a stopped scheduler.
    pub fn new(
        settings: SchedulerSettings,
        archival: ArchivalSettings,
        channel: Arc<dyn SessionChannel>,
        emitter: Arc<StatusEmitter>,
        source: Arc<dyn AgentStatusSource>,
        archiver: Arc<dyn SessionArchiver>,
    ) -> Self {
        Self {
            watched: DashSet::new(),
            channel,
            emitter,
            source,
            archiver,
            settings,
            archival,
            running: Mutex::new(None),
        }
    }

    /// Start the polling loops and the archival sweep.
    ///
    /// Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return false;
        }
        let cancel = CancellationToken::new();
        let _ = self.spawn_cadence(
            Cadence::High,
            self.settings.high_priority_interval(),
            cancel.clone(),
        );
        let _ = self.spawn_cadence(
            Cadence::Low,
            self.settings.low_priority_interval(),
            cancel.clone(),
        );
        if self.archival.enabled {
            let _ = self.spawn_archival_sweep(cancel.clone());
        }
        *running = Some(cancel);
        info!(
            high_ms = self.settings.high_priority_interval_ms,
            low_ms = self.settings.low_priority_interval_ms,
            archival = self.archival.enabled,
            "scheduler started"
        );
        true
    }

    /// Cancel every loop and forget all watched sessions.
    ///
    /// Returns `false` if already stopped.
    pub fn stop(&self) -> bool {
        let Some(cancel) = self.running.lock().take() else {
            return false;
        };
        cancel.cancel();
        self.watched.clear();
        gauge!(WATCHED_SESSIONS).set(0.0);
        info!("scheduler stopped");
        true
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Add a session to the watched set. Returns whether it was added.
    pub fn register_session(&self, session_id: &str) -> bool {
        let added = self.watched.insert(session_id.to_string());
        if added {
            gauge!(WATCHED_SESSIONS).set(self.watched.len() as f64);
            debug!(session_id, "session registered");
        }
        added
    }

    /// Remove a session from the watched set. Returns whether it was present.
    pub fn unregister_session(&self, session_id: &str) -> bool {
        let removed = self.watched.remove(session_id).is_some();
        if removed {
            gauge!(WATCHED_SESSIONS).set(self.watched.len() as f64);
            debug!(session_id, "session unregistered");
        }
        removed
    }

    /// Whether a session is watched.
    pub fn is_watched(&self, session_id: &str) -> bool {
        self.watched.contains(session_id)
    }

    /// Number of watched sessions.
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    fn spawn_cadence(
        self: &Arc<Self>,
        cadence: Cadence,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately.
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => this.tick(cadence).await,
                }
            }
            debug!(cadence = cadence.as_str(), "polling loop exited");
        })
    }

    fn spawn_archival_sweep(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let at = self.archival.sweep_time();
        self.spawn_archival_loop(cancel, move || next_sweep_delay(Utc::now(), at))
    }

    /// Archive after each `next_delay()` until cancelled. Failures are
    /// logged and the loop waits for the next slot.
    fn spawn_archival_loop(
        self: &Arc<Self>,
        cancel: CancellationToken,
        next_delay: impl Fn() -> Duration + Send + 'static,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delay = next_delay();
                debug!(delay_secs = delay.as_secs(), "next archival sweep scheduled");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {
                        match this.trigger_archival().await {
                            Ok(report) => info!(archived = report.archived.len(), skipped = report.skipped, "archival sweep finished"),
                            Err(e) => warn!(error = %e, "archival sweep incomplete"),
                        }
                    }
                }
            }
            debug!("archival sweep exited");
        })
    }

    /// Run one high-priority polling pass.
    pub async fn high_priority_tick(&self) {
        self.tick(Cadence::High).await;
    }

    /// Run one low-priority polling pass.
    pub async fn low_priority_tick(&self) {
        self.tick(Cadence::Low).await;
    }

    async fn tick(&self, cadence: Cadence) {
        counter!(SCHEDULER_TICKS_TOTAL, "cadence" => cadence.as_str()).increment(1);
        let sessions: Vec<String> = self.watched.iter().map(|s| s.key().clone()).collect();

        let polls = sessions
            .iter()
            .filter(|session_id| {
                let watched = self.channel.has_subscribers(session_id);
                if !watched {
                    counter!(SCHEDULER_SKIPPED_SESSIONS_TOTAL).increment(1);
                }
                watched
            })
            .map(|session_id| self.poll_session(session_id, cadence));
        let _ = join_all(polls).await;
    }

    #[instrument(skip(self, cadence), fields(cadence = cadence.as_str()))]
    async fn poll_session(&self, session_id: &str, cadence: Cadence) {
        let (agents, priority) = match cadence {
            Cadence::High => (&self.settings.high_priority_agents, PriorityTier::High),
            Cadence::Low => (&self.settings.low_priority_agents, PriorityTier::Low),
        };

        let lookups = agents
            .iter()
            .map(|agent| self.source.current_status(session_id, agent));
        let results = join_all(lookups).await;

        let mut seen: Vec<AgentStatus> = Vec::new();
        for (agent, result) in agents.iter().zip(results) {
            match result {
                Ok(Some(status)) => {
                    if status.state.is_active() {
                        let _ = self
                            .emitter
                            .emit(session_id, StatusEvent::agent_status(&status), priority);
                    }
                    seen.push(status);
                }
                Ok(None) => {}
                Err(e) => {
                    counter!(LOOKUP_ERRORS_TOTAL, "operation" => "current_status").increment(1);
                    warn!(session_id, agent = %agent, error = %e, "agent status lookup failed");
                }
            }
        }

        if cadence == Cadence::High {
            match self.source.session_progress(session_id).await {
                Ok(progress) => {
                    let progress = progress.unwrap_or_else(|| derived_progress(&seen));
                    let _ = self
                        .emitter
                        .emit(session_id, StatusEvent::progress(progress), priority);
                }
                Err(e) => {
                    counter!(LOOKUP_ERRORS_TOTAL, "operation" => "session_progress").increment(1);
                    warn!(session_id, error = %e, "session progress lookup failed");
                }
            }
        }
    }

    /// Archive every eligible session now.
    ///
    /// Attempts all sessions before reporting; any failure yields
    /// [`ArchivalError::Partial`] carrying the full report.
    #[instrument(skip(self))]
    pub async fn trigger_archival(&self) -> Result<ArchivalReport, ArchivalError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.archival.retention_days));
        let sessions = self
            .source
            .archivable_sessions(cutoff)
            .await
            .map_err(|e| {
                counter!(LOOKUP_ERRORS_TOTAL, "operation" => "archivable_sessions").increment(1);
                ArchivalError::Listing(e)
            })?;

        let mut report = ArchivalReport::default();
        for session in sessions {
            if !session.eligible_for_archive(cutoff) {
                report.skipped += 1;
                continue;
            }
            let path = archive_path(&self.archival.archive_dir, &session.session_id);
            match self.archive_one(&session.session_id, &path).await {
                Ok(()) => {
                    counter!(SESSIONS_ARCHIVED_TOTAL, "status" => "ok").increment(1);
                    info!(session_id = %session.session_id, path = %path, "session archived");
                    report.archived.push(session.session_id);
                }
                Err(e) => {
                    counter!(SESSIONS_ARCHIVED_TOTAL, "status" => "error").increment(1);
                    warn!(session_id = %session.session_id, error = %e, "session archival failed");
                    report.failed.push(ArchivalFailure {
                        session_id: session.session_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.failed.is_empty() {
            Ok(report)
        } else {
            Err(ArchivalError::Partial(report))
        }
    }

    async fn archive_one(&self, session_id: &str, path: &str) -> Result<(), CollaboratorError> {
        self.archiver.archive(session_id, path).await?;
        self.archiver.mark_archived(session_id, path).await
    }
}

/// Mean agent progress when the service has no aggregate. Completed agents
/// count as 100; agents without a figure are ignored.
fn derived_progress(statuses: &[AgentStatus]) -> f64 {
    let figures: Vec<f64> = statuses
        .iter()
        .filter_map(|s| match s.state {
            AgentState::Completed => Some(100.0),
            _ => s.progress,
        })
        .collect();
    if figures.is_empty() {
        0.0
    } else {
        figures.iter().sum::<f64>() / figures.len() as f64
    }
}
