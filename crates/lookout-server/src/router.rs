//! Decision notification router.
//!
//! `critical`/`high` decisions are toasts and publish immediately; each
//! delivery records its latency and breaches of the threshold are logged.
//! `medium` (sidebar) and `low` (silent) decisions share one batch window
//! per session and flush as a single event per importance.

use std::sync::Arc;
use std::time::Duration;

use lookout_core::events::{ChannelEvent, DecisionEvent, PriorityTier, elapsed_ms, event_types};
use lookout_settings::RouterSettings;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::batching::{FlushSink, FlushTrigger, SessionBatcher};
use crate::channel::{SessionChannel, publish_logged};
use crate::metrics::{
    DECISION_LATENCY_BREACHES_TOTAL, DECISION_LATENCY_SECONDS, EVENTS_QUEUED_TOTAL,
    QUEUE_FLUSHES_TOTAL,
};

const COMPONENT: &str = "router";

/// Result of routing one decision. Routing never errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum RouteOutcome {
    /// Published immediately.
    Delivered {
        /// Milliseconds between `created_at` and publish.
        #[serde(rename = "latencyMs")]
        latency_ms: u64,
    },
    /// Placed in the session's batch window.
    Queued,
    /// The immediate publish failed; the decision is not retried.
    Failed,
}

/// Routes decisions to toast, sidebar, or silent delivery.
pub struct DecisionRouter {
    channel: Arc<dyn SessionChannel>,
    batcher: SessionBatcher<DecisionEvent>,
    settings: RouterSettings,
}

impl DecisionRouter {
    /// Create a router publishing to `channel`.
    pub fn new(channel: Arc<dyn SessionChannel>, settings: RouterSettings) -> Self {
        let sink_channel = Arc::clone(&channel);
        let sink: FlushSink<DecisionEvent> = Arc::new(move |session_id, items, trigger| {
            publish_flush(sink_channel.as_ref(), session_id, items, trigger);
        });
        Self {
            channel,
            batcher: SessionBatcher::new(settings.batch_size, sink),
            settings,
        }
    }

    /// Route one decision by importance.
    #[instrument(skip(self, decision), fields(decision_id = %decision.id, importance = %decision.importance))]
    pub fn route_decision(&self, session_id: &str, decision: DecisionEvent) -> RouteOutcome {
        match decision.importance {
            PriorityTier::Critical | PriorityTier::High => self.deliver_now(session_id, &decision),
            PriorityTier::Medium | PriorityTier::Low => {
                counter!(
                    EVENTS_QUEUED_TOTAL,
                    "component" => COMPONENT,
                    "priority" => decision.importance.as_str()
                )
                .increment(1);
                let delay = Duration::from_millis(self.settings.batch_delay_ms);
                let _ = self.batcher.push(session_id, decision, delay);
                RouteOutcome::Queued
            }
        }
    }

    fn deliver_now(&self, session_id: &str, decision: &DecisionEvent) -> RouteOutcome {
        let latency_ms = elapsed_ms(decision.created_at);
        histogram!(DECISION_LATENCY_SECONDS, "importance" => decision.importance.as_str())
            .record(latency_ms as f64 / 1_000.0);
        if latency_ms > self.settings.latency_warn_ms {
            counter!(DECISION_LATENCY_BREACHES_TOTAL).increment(1);
            warn!(
                session_id,
                decision_id = %decision.id,
                latency_ms,
                threshold_ms = self.settings.latency_warn_ms,
                "decision delivery exceeded latency threshold"
            );
        }

        let event = ChannelEvent::new(
            event_types::DECISION_CREATED,
            session_id,
            decision.to_payload(),
        )
        .with_latency(latency_ms);
        if publish_logged(self.channel.as_ref(), session_id, &event, COMPONENT) {
            RouteOutcome::Delivered { latency_ms }
        } else {
            RouteOutcome::Failed
        }
    }

    /// Tell viewers one decision was acknowledged.
    pub fn mark_read(&self, session_id: &str, decision_id: &str) -> bool {
        let event = ChannelEvent::new(
            event_types::DECISION_READ,
            session_id,
            json!({ "decisionId": decision_id }),
        );
        publish_logged(self.channel.as_ref(), session_id, &event, COMPONENT)
    }

    /// Tell viewers every decision in the session was acknowledged.
    pub fn mark_all_read(&self, session_id: &str, count: u64) -> bool {
        let event = ChannelEvent::new(
            event_types::ALL_DECISIONS_READ,
            session_id,
            json!({ "count": count }),
        );
        publish_logged(self.channel.as_ref(), session_id, &event, COMPONENT)
    }

    /// Force-flush every session. Returns the number of decisions delivered.
    pub fn flush_all(&self) -> usize {
        self.batcher.flush_all()
    }

    /// Drop a session's pending decisions and cancel its timer.
    pub fn clear_queue(&self, session_id: &str) -> usize {
        self.batcher.clear(session_id)
    }

    /// Flush batch windows older than `stale_after_ms`.
    pub fn sweep_stale(&self) -> usize {
        self.batcher
            .sweep_stale(Duration::from_millis(self.settings.stale_after_ms))
    }

    /// Pending decisions for a session.
    pub fn queue_len(&self, session_id: &str) -> usize {
        self.batcher.len(session_id)
    }

    /// Whether a session has an armed flush timer.
    pub fn has_pending_timer(&self, session_id: &str) -> bool {
        self.batcher.has_pending_timer(session_id)
    }
}

fn publish_flush(
    channel: &dyn SessionChannel,
    session_id: &str,
    items: Vec<DecisionEvent>,
    trigger: FlushTrigger,
) {
    counter!(QUEUE_FLUSHES_TOTAL, "component" => COMPONENT, "trigger" => trigger.as_str())
        .increment(1);

    let (medium, low): (Vec<_>, Vec<_>) = items
        .into_iter()
        .partition(|d| d.importance <= PriorityTier::Medium);

    if !medium.is_empty() {
        let decisions: Vec<Value> = medium.iter().map(DecisionEvent::to_payload).collect();
        let event = ChannelEvent::new(
            event_types::DECISION_BATCH,
            session_id,
            json!({ "type": "medium", "count": decisions.len(), "decisions": decisions }),
        );
        let _ = publish_logged(channel, session_id, &event, COMPONENT);
    }
    if !low.is_empty() {
        let decisions: Vec<Value> = low.iter().map(DecisionEvent::to_payload).collect();
        let event = ChannelEvent::new(
            event_types::DECISION_SILENT,
            session_id,
            json!({ "count": decisions.len(), "decisions": decisions }),
        );
        let _ = publish_logged(channel, session_id, &event, COMPONENT);
    }
    debug!(session_id, trigger = trigger.as_str(), "decision flush");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::RecordingChannel;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn make_router() -> (DecisionRouter, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::new());
        let router = DecisionRouter::new(channel.clone(), RouterSettings::default());
        (router, channel)
    }

    fn decision(id: &str, importance: PriorityTier) -> DecisionEvent {
        DecisionEvent {
            id: id.into(),
            agent: "planner".into(),
            summary: format!("decision {id}"),
            detail: None,
            importance,
            created_at: Utc::now(),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn critical_and_high_are_delivered_immediately() {
        let (router, channel) = make_router();
        assert_matches!(
            router.route_decision("s", decision("d1", PriorityTier::Critical)),
            RouteOutcome::Delivered { .. }
        );
        assert_matches!(
            router.route_decision("s", decision("d2", PriorityTier::High)),
            RouteOutcome::Delivered { .. }
        );
        let events = channel.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == event_types::DECISION_CREATED));
        assert!(events.iter().all(|e| e.latency.is_some()));
        assert_eq!(events[0].data.as_ref().unwrap()["route"], "toast");
        assert!(!router.has_pending_timer("s"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_delivery_still_proceeds() {
        let (router, channel) = make_router();
        let mut late = decision("d1", PriorityTier::Critical);
        late.created_at = Utc::now() - chrono::Duration::seconds(1);

        let outcome = router.route_decision("s", late);
        assert_matches!(outcome, RouteOutcome::Delivered { latency_ms } if latency_ms >= 1_000);
        assert_eq!(channel.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_medium_decisions_batch_at_window_end() {
        let (router, channel) = make_router();
        assert_eq!(
            router.route_decision("s", decision("m1", PriorityTier::Medium)),
            RouteOutcome::Queued
        );
        tokio::time::sleep(ms(10)).await;
        let _ = router.route_decision("s", decision("m2", PriorityTier::Medium));

        tokio::time::sleep(ms(480)).await;
        assert_eq!(channel.count(), 0);
        tokio::time::sleep(ms(20)).await;

        let events = channel.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::DECISION_BATCH);
        let data = events[0].data.as_ref().unwrap();
        assert_eq!(data["type"], "medium");
        assert_eq!(data["count"], 2);
        assert_eq!(data["decisions"][0]["id"], "m1");
        assert_eq!(data["decisions"][1]["id"], "m2");
        assert_eq!(data["decisions"][0]["route"], "sidebar");
    }

    #[tokio::test(start_paused = true)]
    async fn low_decisions_flush_silently() {
        let (router, channel) = make_router();
        let _ = router.route_decision("s", decision("l1", PriorityTier::Low));
        tokio::time::sleep(ms(510)).await;
        let events = channel.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::DECISION_SILENT);
        assert_eq!(events[0].data.as_ref().unwrap()["count"], 1);
        assert!(events[0].latency.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_window_publishes_medium_then_low() {
        let (router, channel) = make_router();
        let _ = router.route_decision("s", decision("l1", PriorityTier::Low));
        let _ = router.route_decision("s", decision("m1", PriorityTier::Medium));
        tokio::time::sleep(ms(510)).await;
        assert_eq!(
            channel.event_types(),
            vec![event_types::DECISION_BATCH, event_types::DECISION_SILENT]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_threshold_flushes_immediately() {
        let (router, channel) = make_router();
        for i in 0..5 {
            let _ = router.route_decision("s", decision(&format!("m{i}"), PriorityTier::Medium));
        }
        assert_eq!(channel.count(), 1);
        assert_eq!(channel.events()[0].data.as_ref().unwrap()["count"], 5);
        assert!(!router.has_pending_timer("s"));
        assert_eq!(router.queue_len("s"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_reports_failed() {
        let (router, channel) = make_router();
        channel.fail_publishes();
        assert_eq!(
            router.route_decision("s", decision("d1", PriorityTier::High)),
            RouteOutcome::Failed
        );
        assert!(!router.mark_read("s", "d1"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_acknowledgements_publish_immediately() {
        let (router, channel) = make_router();
        assert!(router.mark_read("s", "d7"));
        assert!(router.mark_all_read("s", 12));
        let events = channel.events();
        assert_eq!(events[0].event_type, event_types::DECISION_READ);
        assert_eq!(events[0].data.as_ref().unwrap()["decisionId"], "d7");
        assert_eq!(events[1].event_type, event_types::ALL_DECISIONS_READ);
        assert_eq!(events[1].data.as_ref().unwrap()["count"], 12);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_and_flush_all() {
        let (router, channel) = make_router();
        let _ = router.route_decision("a", decision("m1", PriorityTier::Medium));
        let _ = router.route_decision("b", decision("m2", PriorityTier::Medium));
        assert_eq!(router.clear_queue("a"), 1);
        assert_eq!(router.flush_all(), 1);
        assert_eq!(channel.count(), 1);
        assert_eq!(channel.events()[0].session_id, "b");
    }
}
