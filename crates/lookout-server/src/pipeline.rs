//! Component wiring and viewer lifecycle.
//!
//! [`Pipeline`] constructs the channel, emitter, router, scheduler and rate
//! limiters explicitly and hands each its dependencies. Nothing is global:
//! tests build as many independent pipelines as they like.

use std::sync::Arc;
use std::time::Duration;

use lookout_settings::LookoutSettings;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{BroadcastManager, ClientConnection, SessionChannel};
use crate::collaborators::{AgentStatusSource, SessionArchiver};
use crate::emitter::StatusEmitter;
use crate::metrics::WS_CONNECTIONS_TOTAL;
use crate::rate_limit::{ChannelGuards, LimitDecision};
use crate::router::DecisionRouter;
use crate::scheduler::SessionScheduler;
use crate::shutdown::ShutdownCoordinator;

/// How often over-age session queues are checked.
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Result of a join/leave request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// Applied.
    Applied,
    /// Nothing to do (unknown connection or not subscribed).
    Unchanged,
    /// Rejected by the subscription limiter.
    RateLimited {
        /// Time until the caller may retry.
        retry_after: Duration,
    },
}

/// Result of ending a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndedSession {
    /// Pending status events discarded.
    pub discarded_status: usize,
    /// Pending decisions discarded.
    pub discarded_decisions: usize,
    /// Whether the session was being watched.
    pub unregistered: bool,
}

/// The delivery pipeline.
///
/// Single-use: once [`shutdown`](Self::shutdown) has run, [`start`](Self::start)
/// refuses to bring background work back up.
pub struct Pipeline {
    broadcast: Arc<BroadcastManager>,
    emitter: Arc<StatusEmitter>,
    router: Arc<DecisionRouter>,
    scheduler: Arc<SessionScheduler>,
    guards: ChannelGuards,
    shutdown: ShutdownCoordinator,
    channel_buffer: usize,
}

impl Pipeline {
    /// Wire every component from settings and the external collaborators.
    pub fn new(
        settings: &LookoutSettings,
        source: Arc<dyn AgentStatusSource>,
        archiver: Arc<dyn SessionArchiver>,
    ) -> Self {
        let broadcast = Arc::new(BroadcastManager::new());
        let channel: Arc<dyn SessionChannel> = broadcast.clone();
        let emitter = Arc::new(StatusEmitter::new(
            Arc::clone(&channel),
            settings.emitter.clone(),
        ));
        let router = Arc::new(DecisionRouter::new(
            Arc::clone(&channel),
            settings.router.clone(),
        ));
        let scheduler = Arc::new(SessionScheduler::new(
            settings.scheduler.clone(),
            settings.archival.clone(),
            channel,
            Arc::clone(&emitter),
            source,
            archiver,
        ));
        Self {
            broadcast,
            emitter,
            router,
            scheduler,
            guards: ChannelGuards::new(&settings.rate_limits),
            shutdown: ShutdownCoordinator::new(),
            channel_buffer: settings.server.channel_buffer.max(1),
        }
    }

    /// Start the scheduler, the rate-limit sweepers and the stale-queue sweep.
    ///
    /// Returns `false` if already running or already shut down.
    pub fn start(&self) -> bool {
        if self.shutdown.is_shutting_down() {
            warn!("pipeline already shut down, not restarting");
            return false;
        }
        if !self.scheduler.start() {
            return false;
        }
        let token = self.shutdown.token();
        for handle in self.guards.spawn_sweepers(&token) {
            self.shutdown.track(handle);
        }

        let emitter = Arc::clone(&self.emitter);
        let router = Arc::clone(&self.router);
        self.shutdown.track(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STALE_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let flushed = emitter.sweep_stale() + router.sweep_stale();
                        if flushed > 0 {
                            debug!(flushed, "stale queues force-flushed");
                        }
                    }
                }
            }
        }));
        info!("pipeline started");
        true
    }

    /// Stop background work and flush everything still queued.
    pub async fn shutdown(&self) {
        let _ = self.scheduler.stop();
        self.shutdown.graceful_shutdown(None).await;
        let status = self.emitter.flush_all();
        let decisions = self.router.flush_all();
        info!(status, decisions, "pipeline stopped, queues flushed");
    }

    // ── viewer lifecycle ────────────────────────────────────────────

    /// Admit a new viewer from `remote`, subject to the connection limiter.
    pub fn check_connect(&self, remote: &str) -> LimitDecision {
        self.guards.connection.check(remote)
    }

    /// Register a viewer connection and return its outbox receiver.
    pub fn connect_viewer(&self, remote: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(self.channel_buffer);
        let id = Uuid::now_v7().to_string();
        let connection = Arc::new(ClientConnection::new(id, remote.to_string(), tx));
        self.broadcast.add(Arc::clone(&connection));
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        debug!(conn_id = %connection.id, remote, "viewer connected");
        (connection, rx)
    }

    /// Count one inbound frame from a connection.
    pub fn check_message(&self, connection_id: &str) -> LimitDecision {
        self.guards.message.check(connection_id)
    }

    /// Subscribe a viewer to a session and start watching it.
    pub fn join(&self, connection: &ClientConnection, session_id: &str) -> SubscriptionChange {
        if let LimitDecision::Denied { retry_after } = self.guards.subscription.check(&connection.remote) {
            return SubscriptionChange::RateLimited { retry_after };
        }
        if self.broadcast.join(&connection.id, session_id).is_none() {
            return SubscriptionChange::Unchanged;
        }
        let _ = self.scheduler.register_session(session_id);
        SubscriptionChange::Applied
    }

    /// Unsubscribe a viewer; the last viewer out stops the watch.
    pub fn leave(&self, connection: &ClientConnection, session_id: &str) -> SubscriptionChange {
        if let LimitDecision::Denied { retry_after } = self.guards.subscription.check(&connection.remote) {
            return SubscriptionChange::RateLimited { retry_after };
        }
        match self.broadcast.leave(&connection.id, session_id) {
            None => SubscriptionChange::Unchanged,
            Some(_) => {
                let _ = self.unwatch_if_orphaned(session_id);
                SubscriptionChange::Applied
            }
        }
    }

    /// Drop a viewer, unwatch sessions it was the last viewer of, and reset
    /// its message window.
    ///
    /// Works from the connection's own subscription list, so a viewer the
    /// channel already evicted is still cleaned up.
    pub fn disconnect_viewer(&self, connection: &ClientConnection) {
        let _ = self.guards.message.reset(&connection.id);
        let evicted = self.broadcast.remove(&connection.id).is_none();
        connection.close();
        let unwatched = connection
            .sessions()
            .iter()
            .filter(|session_id| self.unwatch_if_orphaned(session_id))
            .count();
        debug!(conn_id = %connection.id, evicted, unwatched, "viewer disconnected");
    }

    /// Stop watching a session that has no viewers left.
    ///
    /// `join` registers after entering the room, so a viewer that slips in
    /// between the emptiness check and the removal is seen by the re-check
    /// and the watch is restored.
    fn unwatch_if_orphaned(&self, session_id: &str) -> bool {
        if self.broadcast.has_subscribers(session_id) {
            return false;
        }
        let removed = self.scheduler.unregister_session(session_id);
        if self.broadcast.has_subscribers(session_id) {
            let _ = self.scheduler.register_session(session_id);
            return false;
        }
        removed
    }

    // ── session lifecycle ───────────────────────────────────────────

    /// Discard pending work for a finished session and stop watching it.
    pub fn end_session(&self, session_id: &str) -> EndedSession {
        EndedSession {
            discarded_status: self.emitter.clear_queue(session_id),
            discarded_decisions: self.router.clear_queue(session_id),
            unregistered: self.scheduler.unregister_session(session_id),
        }
    }

    // ── accessors ───────────────────────────────────────────────────

    /// Viewer registry and rooms.
    pub fn broadcast(&self) -> &Arc<BroadcastManager> {
        &self.broadcast
    }

    /// Status emitter.
    pub fn emitter(&self) -> &Arc<StatusEmitter> {
        &self.emitter
    }

    /// Decision router.
    pub fn router(&self) -> &Arc<DecisionRouter> {
        &self.router
    }

    /// Session scheduler.
    pub fn scheduler(&self) -> &Arc<SessionScheduler> {
        &self.scheduler
    }

    /// Caller rate limiters.
    pub fn guards(&self) -> &ChannelGuards {
        &self.guards
    }
}
