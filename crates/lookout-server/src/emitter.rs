//! Priority status emitter.
//!
//! `critical` events are published immediately with their observed latency.
//! Everything else waits in the session's queue until the earliest tier
//! deadline, the batch threshold, or a forced flush. A flush publishes one
//! event per tier present, most urgent tier first.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lookout_core::events::{
    ChannelEvent, PriorityTier, QueuedEvent, StatusEvent, elapsed_ms, event_types,
};
use lookout_settings::EmitterSettings;
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::batching::{FlushSink, FlushTrigger, PushOutcome, SessionBatcher};
use crate::channel::{SessionChannel, publish_logged};
use crate::metrics::{CRITICAL_LATENCY_SECONDS, EVENTS_QUEUED_TOTAL, QUEUE_FLUSHES_TOTAL};

const COMPONENT: &str = "emitter";

/// What happened to an emitted status event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmitOutcome {
    /// Published immediately (critical).
    Published,
    /// Waiting in the session queue.
    Queued,
    /// Filled the batch; the queue was flushed.
    Flushed,
    /// Immediate publish failed.
    Failed,
}

/// Classifies, batches and flushes status events per session.
pub struct StatusEmitter {
    channel: Arc<dyn SessionChannel>,
    batcher: SessionBatcher<QueuedEvent>,
    settings: EmitterSettings,
}

impl StatusEmitter {
    /// Create an emitter publishing to `channel`.
    pub fn new(channel: Arc<dyn SessionChannel>, settings: EmitterSettings) -> Self {
        let sink_channel = Arc::clone(&channel);
        let sink: FlushSink<QueuedEvent> = Arc::new(move |session_id, items, trigger| {
            publish_flush(sink_channel.as_ref(), session_id, items, trigger);
        });
        Self {
            channel,
            batcher: SessionBatcher::new(settings.batch_size, sink),
            settings,
        }
    }

    /// Added delay budget for a tier. Zero for `critical`.
    pub fn delay_for(&self, priority: PriorityTier) -> Duration {
        let ms = match priority {
            PriorityTier::Critical => 0,
            PriorityTier::High => self.settings.high_delay_ms,
            PriorityTier::Medium => self.settings.medium_delay_ms,
            PriorityTier::Low => self.settings.low_delay_ms,
        };
        Duration::from_millis(ms)
    }

    /// Deliver one status event at `priority`.
    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub fn emit(&self, session_id: &str, event: StatusEvent, priority: PriorityTier) -> EmitOutcome {
        if priority.bypasses_queue() {
            let latency = elapsed_ms(event.occurred_at);
            histogram!(CRITICAL_LATENCY_SECONDS).record(latency as f64 / 1_000.0);
            let envelope =
                ChannelEvent::new(event.event_type, session_id, event.payload).with_latency(latency);
            debug!(latency_ms = latency, "critical status published");
            return if publish_logged(self.channel.as_ref(), session_id, &envelope, COMPONENT) {
                EmitOutcome::Published
            } else {
                EmitOutcome::Failed
            };
        }

        counter!(EVENTS_QUEUED_TOTAL, "component" => COMPONENT, "priority" => priority.as_str())
            .increment(1);
        let item = QueuedEvent::new(session_id, event, priority);
        match self.batcher.push(session_id, item, self.delay_for(priority)) {
            PushOutcome::Queued => EmitOutcome::Queued,
            PushOutcome::Flushed => EmitOutcome::Flushed,
        }
    }

    /// Wrap several status events into one batch item and emit it.
    ///
    /// The batch payload carries `priority` like a flushed batch does. An
    /// empty list is a no-op.
    pub fn emit_batch(
        &self,
        session_id: &str,
        events: Vec<StatusEvent>,
        priority: PriorityTier,
    ) -> Option<EmitOutcome> {
        if events.is_empty() {
            return None;
        }
        let mut batch = StatusEvent::batch(events);
        if let Some(payload) = batch.payload.as_object_mut() {
            let _ = payload.insert("priority".into(), json!(priority));
        }
        Some(self.emit(session_id, batch, priority))
    }

    /// Force-flush every session. Returns the number of events delivered.
    pub fn flush_all(&self) -> usize {
        self.batcher.flush_all()
    }

    /// Force-flush one session.
    pub fn flush(&self, session_id: &str) -> usize {
        self.batcher.flush(session_id)
    }

    /// Drop a session's pending events and cancel its timer.
    pub fn clear_queue(&self, session_id: &str) -> usize {
        self.batcher.clear(session_id)
    }

    /// Flush queues older than `stale_after_ms`.
    pub fn sweep_stale(&self) -> usize {
        self.batcher
            .sweep_stale(Duration::from_millis(self.settings.stale_after_ms))
    }

    /// Pending events for a session.
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
    items: Vec<QueuedEvent>,
    trigger: FlushTrigger,
) {
    counter!(QUEUE_FLUSHES_TOTAL, "component" => COMPONENT, "trigger" => trigger.as_str())
        .increment(1);

    let mut by_tier: BTreeMap<PriorityTier, Vec<QueuedEvent>> = BTreeMap::new();
    for item in items {
        by_tier.entry(item.priority).or_default().push(item);
    }

    for (tier, mut group) in by_tier {
        let event = if group.len() == 1 && !group[0].is_batch() {
            let Some(item) = group.pop() else { continue };
            ChannelEvent::new(item.event_type, session_id, item.payload)
        } else {
            let events: Vec<Value> = group.iter().flat_map(QueuedEvent::batch_entries).collect();
            ChannelEvent::new(
                event_types::AGENT_STATUS_BATCH,
                session_id,
                json!({ "priority": tier, "count": events.len(), "events": events }),
            )
        };
        debug!(session_id, priority = %tier, trigger = trigger.as_str(), "status flush");
        let _ = publish_logged(channel, session_id, &event, COMPONENT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::RecordingChannel;
    use chrono::Utc;

    fn make_emitter() -> (StatusEmitter, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel::new());
        let emitter = StatusEmitter::new(channel.clone(), EmitterSettings::default());
        (emitter, channel)
    }

    fn status(agent: &str) -> StatusEvent {
        StatusEvent {
            event_type: event_types::AGENT_STATUS_UPDATE.into(),
            payload: json!({ "agent": agent }),
            occurred_at: Utc::now(),
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[tokio::test(start_paused = true)]
    async fn critical_publishes_immediately_with_latency() {
        let (emitter, channel) = make_emitter();
        let mut event = status("coder");
        event.occurred_at = Utc::now() - chrono::Duration::milliseconds(40);

        assert_eq!(
            emitter.emit("s", event, PriorityTier::Critical),
            EmitOutcome::Published
        );
        let events = channel.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::AGENT_STATUS_UPDATE);
        assert!(events[0].latency.unwrap() >= 40);
        assert!(!emitter.has_pending_timer("s"));
    }

    #[tokio::test(start_paused = true)]
    async fn high_waits_for_its_delay() {
        let (emitter, channel) = make_emitter();
        assert_eq!(
            emitter.emit("s", status("coder"), PriorityTier::High),
            EmitOutcome::Queued
        );
        assert!(emitter.has_pending_timer("s"));

        tokio::time::sleep(ms(290)).await;
        assert_eq!(channel.count(), 0);
        tokio::time::sleep(ms(20)).await;

        let events = channel.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::AGENT_STATUS_UPDATE);
        assert!(events[0].latency.is_none());
        assert_eq!(emitter.queue_len("s"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_tier_items_flush_as_one_batch() {
        let (emitter, channel) = make_emitter();
        let _ = emitter.emit("s", status("a"), PriorityTier::Medium);
        let _ = emitter.emit("s", status("b"), PriorityTier::Medium);
        let _ = emitter.emit("s", status("c"), PriorityTier::Medium);
        tokio::time::sleep(ms(900)).await;

        let events = channel.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::AGENT_STATUS_BATCH);
        let data = events[0].data.as_ref().unwrap();
        assert_eq!(data["priority"], "medium");
        assert_eq!(data["count"], 3);
        assert_eq!(data["events"][0]["data"]["agent"], "a");
        assert_eq!(data["events"][2]["data"]["agent"], "c");
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_tiers_flush_together_most_urgent_first() {
        let (emitter, channel) = make_emitter();
        let _ = emitter.emit("s", status("slow"), PriorityTier::Low);
        let _ = emitter.emit("s", status("fast"), PriorityTier::High);

        // The high item pulls the single timer forward to ~300 ms.
        tokio::time::sleep(ms(310)).await;
        let events = channel.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data.as_ref().unwrap()["agent"], "fast");
        assert_eq!(events[1].data.as_ref().unwrap()["agent"], "slow");
        assert!(!emitter.has_pending_timer("s"));
    }

    #[tokio::test(start_paused = true)]
    async fn critical_overtakes_pending_low_queue() {
        let (emitter, channel) = make_emitter();
        let _ = emitter.emit("s", status("reviewer"), PriorityTier::Low);
        tokio::time::sleep(ms(100)).await;
        let _ = emitter.emit("s", status("orchestrator"), PriorityTier::Critical);

        let events = channel.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_ref().unwrap()["agent"], "orchestrator");
        assert_eq!(emitter.queue_len("s"), 1);

        tokio::time::sleep(ms(1_500)).await;
        let events = channel.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data.as_ref().unwrap()["agent"], "reviewer");
    }

    #[tokio::test(start_paused = true)]
    async fn batch_threshold_flushes_without_timer() {
        let (emitter, channel) = make_emitter();
        for i in 0..9 {
            assert_eq!(
                emitter.emit("s", status(&format!("a{i}")), PriorityTier::Low),
                EmitOutcome::Queued
            );
        }
        assert_eq!(
            emitter.emit("s", status("a9"), PriorityTier::Low),
            EmitOutcome::Flushed
        );
        assert_eq!(channel.count(), 1);
        assert!(!emitter.has_pending_timer("s"));
        assert_eq!(channel.events()[0].data.as_ref().unwrap()["count"], 10);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_batch_wraps_events() {
        let (emitter, channel) = make_emitter();
        assert!(emitter.emit_batch("s", vec![], PriorityTier::High).is_none());

        let outcome = emitter.emit_batch("s", vec![status("a"), status("b")], PriorityTier::High);
        assert_eq!(outcome, Some(EmitOutcome::Queued));
        tokio::time::sleep(ms(310)).await;

        let events = channel.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::AGENT_STATUS_BATCH);
        let data = events[0].data.as_ref().unwrap();
        assert_eq!(data["priority"], "high");
        assert_eq!(data["count"], 2);
        assert_eq!(data["events"][0]["data"]["agent"], "a");
    }

    #[tokio::test(start_paused = true)]
    async fn batch_items_merge_into_tier_batch_without_nesting() {
        let (emitter, channel) = make_emitter();
        let _ = emitter.emit_batch("s", vec![status("a"), status("b")], PriorityTier::Medium);
        let _ = emitter.emit("s", status("c"), PriorityTier::Medium);
        assert_eq!(emitter.flush_all(), 2);

        let events = channel.events();
        assert_eq!(events.len(), 1);
        let data = events[0].data.as_ref().unwrap();
        assert_eq!(data["priority"], "medium");
        assert_eq!(data["count"], 3);
        let agents: Vec<&str> = data["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["data"]["agent"].as_str().unwrap())
            .collect();
        assert_eq!(agents, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_batch_carries_priority() {
        let (emitter, channel) = make_emitter();
        let outcome = emitter.emit_batch("s", vec![status("a")], PriorityTier::Critical);
        assert_eq!(outcome, Some(EmitOutcome::Published));

        let events = channel.events();
        let data = events[0].data.as_ref().unwrap();
        assert_eq!(data["priority"], "critical");
        assert_eq!(data["count"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_queue_discards_pending() {
        let (emitter, channel) = make_emitter();
        let _ = emitter.emit("s", status("a"), PriorityTier::Low);
        assert_eq!(emitter.clear_queue("s"), 1);
        tokio::time::sleep(ms(2_000)).await;
        assert_eq!(channel.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_publishes_everything_now() {
        let (emitter, channel) = make_emitter();
        let _ = emitter.emit("a", status("x"), PriorityTier::Low);
        let _ = emitter.emit("b", status("y"), PriorityTier::Medium);
        assert_eq!(emitter.flush_all(), 2);
        assert_eq!(channel.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_still_clears_queue() {
        let (emitter, channel) = make_emitter();
        channel.fail_publishes();
        assert_eq!(
            emitter.emit("s", status("a"), PriorityTier::Critical),
            EmitOutcome::Failed
        );
        let _ = emitter.emit("s", status("b"), PriorityTier::High);
        tokio::time::sleep(ms(310)).await;
        assert_eq!(emitter.queue_len("s"), 0);
        assert!(!emitter.has_pending_timer("s"));
    }

    #[test]
    fn delays_match_settings() {
        let channel = Arc::new(RecordingChannel::new());
        let emitter = StatusEmitter::new(channel, EmitterSettings::default());
        assert_eq!(emitter.delay_for(PriorityTier::Critical), Duration::ZERO);
        assert_eq!(emitter.delay_for(PriorityTier::High), ms(300));
        assert_eq!(emitter.delay_for(PriorityTier::Medium), ms(800));
        assert_eq!(emitter.delay_for(PriorityTier::Low), ms(1_500));
    }
}
