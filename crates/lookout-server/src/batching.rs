//! Per-session queue with a single pending flush timer.
//!
//! Shared by the status emitter and the decision router. Each session owns
//! one [`DashMap`] slot holding its queued items and at most one armed
//! timer. A slot is flushed when:
//!
//! - its timer fires (the earliest deadline of any queued item),
//! - it reaches the batch threshold (timer cancelled, flushed inline),
//! - it is force-flushed (`flush`, `flush_all`, or the stale sweep).
//!
//! The sink runs while the slot guard is held, so flushes of one session
//! never interleave. The sink must not call back into the same batcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Why a slot was flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The pending timer fired.
    Timer,
    /// The queue reached the batch threshold.
    Threshold,
    /// Explicit `flush`/`flush_all` (e.g. shutdown).
    Forced,
    /// The safety sweep found an over-age queue.
    Stale,
}

impl FlushTrigger {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Threshold => "threshold",
            Self::Forced => "forced",
            Self::Stale => "stale",
        }
    }
}

/// What `push` did with the item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Held until the session's timer fires.
    Queued,
    /// The push filled the batch and the queue was flushed inline.
    Flushed,
}

/// Callback receiving a session's drained items, oldest first.
pub type FlushSink<T> = Arc<dyn Fn(&str, Vec<T>, FlushTrigger) + Send + Sync>;

struct PendingTimer {
    id: u64,
    deadline: Instant,
    handle: AbortHandle,
}

struct Slot<T> {
    items: Vec<T>,
    first_enqueued: Instant,
    timer: Option<PendingTimer>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            first_enqueued: Instant::now(),
            timer: None,
        }
    }

    /// Cancel the timer and drain the queue.
    fn take(&mut self) -> Vec<T> {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
        std::mem::take(&mut self.items)
    }
}

struct Inner<T> {
    slots: DashMap<String, Slot<T>>,
    batch_size: usize,
    sink: FlushSink<T>,
    next_timer_id: AtomicU64,
}

impl<T: Send + Sync + 'static> Inner<T> {
    /// Flush on behalf of a timer, but only if it is still the armed one.
    fn fire(&self, session_id: &str, timer_id: u64) {
        {
            let Some(mut slot) = self.slots.get_mut(session_id) else {
                return;
            };
            if slot.timer.as_ref().map(|t| t.id) != Some(timer_id) {
                return;
            }
            slot.timer = None;
            let items = std::mem::take(&mut slot.items);
            if !items.is_empty() {
                (self.sink)(session_id, items, FlushTrigger::Timer);
            }
        }
        self.remove_if_idle(session_id);
    }

    fn flush_where(
        &self,
        session_id: &str,
        trigger: FlushTrigger,
        pred: impl Fn(&Slot<T>) -> bool,
    ) -> usize {
        let flushed = {
            let Some(mut slot) = self.slots.get_mut(session_id) else {
                return 0;
            };
            if !pred(&slot) {
                return 0;
            }
            let items = slot.take();
            let n = items.len();
            if n > 0 {
                (self.sink)(session_id, items, trigger);
            }
            n
        };
        self.remove_if_idle(session_id);
        flushed
    }

    fn remove_if_idle(&self, session_id: &str) {
        let _ = self
            .slots
            .remove_if(session_id, |_, slot| slot.items.is_empty() && slot.timer.is_none());
    }
}

/// Session-keyed batching queue. Cheap to clone.
pub struct SessionBatcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SessionBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> SessionBatcher<T> {
    /// Create a batcher that flushes at `batch_size` items (minimum 1).
    pub fn new(batch_size: usize, sink: FlushSink<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                batch_size: batch_size.max(1),
                sink,
                next_timer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queue an item that must be delivered within `delay`.
    ///
    /// Arms the session's timer if none is pending, or re-arms it when this
    /// item's deadline is earlier. Must be called inside a Tokio runtime.
    pub fn push(&self, session_id: &str, item: T, delay: Duration) -> PushOutcome {
        let outcome = {
            let mut slot = self
                .inner
                .slots
                .entry(session_id.to_string())
                .or_insert_with(Slot::new);
            if slot.items.is_empty() {
                slot.first_enqueued = Instant::now();
            }
            slot.items.push(item);

            if slot.items.len() >= self.inner.batch_size {
                let items = slot.take();
                (self.inner.sink)(session_id, items, FlushTrigger::Threshold);
                PushOutcome::Flushed
            } else {
                let deadline = Instant::now() + delay;
                let rearm = slot.timer.as_ref().is_none_or(|t| deadline < t.deadline);
                if rearm {
                    if let Some(old) = slot.timer.take() {
                        old.handle.abort();
                    }
                    slot.timer = Some(self.arm(session_id, deadline));
                }
                PushOutcome::Queued
            }
        };
        if outcome == PushOutcome::Flushed {
            self.inner.remove_if_idle(session_id);
        }
        outcome
    }

    fn arm(&self, session_id: &str, deadline: Instant) -> PendingTimer {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let sid = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(&sid, id);
            }
        })
        .abort_handle();
        PendingTimer {
            id,
            deadline,
            handle,
        }
    }

    /// Flush one session now. Returns the number of items delivered.
    pub fn flush(&self, session_id: &str) -> usize {
        self.inner
            .flush_where(session_id, FlushTrigger::Forced, |_| true)
    }

    /// Flush every session now. Returns the number of items delivered.
    pub fn flush_all(&self) -> usize {
        self.session_ids().iter().map(|sid| self.flush(sid)).sum()
    }

    /// Discard a session's queue and cancel its timer.
    ///
    /// Returns the number of items dropped.
    pub fn clear(&self, session_id: &str) -> usize {
        match self.inner.slots.remove(session_id) {
            Some((_, mut slot)) => slot.take().len(),
            None => 0,
        }
    }

    /// Force-flush any session whose oldest item has waited at least `max_age`.
    ///
    /// Returns the number of sessions flushed.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        self.session_ids()
            .iter()
            .filter(|sid| {
                self.inner.flush_where(sid, FlushTrigger::Stale, |slot| {
                    !slot.items.is_empty() && slot.first_enqueued.elapsed() >= max_age
                }) > 0
            })
            .count()
    }

    /// Items queued for a session.
    pub fn len(&self, session_id: &str) -> usize {
        self.inner.slots.get(session_id).map_or(0, |s| s.items.len())
    }

    /// Whether a session has an armed timer.
    pub fn has_pending_timer(&self, session_id: &str) -> bool {
        self.inner
            .slots
            .get(session_id)
            .is_some_and(|s| s.timer.is_some())
    }

    /// Sessions with a live slot.
    pub fn session_count(&self) -> usize {
        self.inner.slots.len()
    }

    fn session_ids(&self) -> Vec<String> {
        self.inner.slots.iter().map(|e| e.key().clone()).collect()
    }
}
