//! Fixed-window caller rate limiting.
//!
//! One [`FixedWindowLimiter`] per guarded operation. Entries are created
//! lazily on first use, replaced once their window has elapsed, and removed
//! by a periodic sweep so idle callers do not accumulate.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lookout_settings::{LimitRule, RateLimitSettings};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::RATE_LIMIT_DENIALS_TOTAL;

/// Per-identifier window state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// Calls counted in the current window, including denied ones.
    pub count: u32,
    /// When the current window ends.
    pub window_reset_at: Instant,
}

/// Outcome of a rate-limit check. Denial is a value, never an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitDecision {
    /// The call may proceed.
    Allowed {
        /// Calls left in this window.
        remaining: u32,
    },
    /// The call must be rejected.
    Denied {
        /// Time until the window resets.
        retry_after: Duration,
    },
}

impl LimitDecision {
    /// Whether the call may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Fixed-window counter keyed by caller identifier.
pub struct FixedWindowLimiter {
    operation: &'static str,
    window: Duration,
    max: u32,
    entries: DashMap<String, RateLimitEntry>,
}

impl FixedWindowLimiter {
    /// Create a limiter allowing `max` calls per `window`.
    pub fn new(operation: &'static str, window: Duration, max: u32) -> Self {
        Self {
            operation,
            window,
            max,
            entries: DashMap::new(),
        }
    }

    /// Create a limiter from a settings rule.
    pub fn from_rule(operation: &'static str, rule: LimitRule) -> Self {
        Self::new(operation, Duration::from_millis(rule.window_ms), rule.max)
    }

    /// Guarded operation name (metric label).
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Count one call for `identifier`.
    pub fn check(&self, identifier: &str) -> LimitDecision {
        self.check_at(identifier, Instant::now())
    }

    /// Count one call for `identifier` as of `now`.
    pub fn check_at(&self, identifier: &str, now: Instant) -> LimitDecision {
        let fresh = RateLimitEntry {
            count: 0,
            window_reset_at: now + self.window,
        };
        let mut entry = self
            .entries
            .entry(identifier.to_string())
            .or_insert(fresh);
        if now >= entry.window_reset_at {
            *entry = fresh;
        }
        entry.count = entry.count.saturating_add(1);

        if entry.count <= self.max {
            LimitDecision::Allowed {
                remaining: self.max - entry.count,
            }
        } else {
            let retry_after = entry.window_reset_at.saturating_duration_since(now);
            drop(entry);
            counter!(RATE_LIMIT_DENIALS_TOTAL, "operation" => self.operation).increment(1);
            debug!(
                operation = self.operation,
                identifier,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limit exceeded"
            );
            LimitDecision::Denied { retry_after }
        }
    }

    /// Forget an identifier's window.
    pub fn reset(&self, identifier: &str) -> bool {
        self.entries.remove(identifier).is_some()
    }

    /// Current entry for an identifier.
    pub fn entry(&self, identifier: &str) -> Option<RateLimitEntry> {
        self.entries.get(identifier).map(|e| *e)
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.window_reset_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Tracked identifiers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no identifier is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately.
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            debug!(operation = limiter.operation, removed, "swept expired rate-limit entries");
                        }
                    }
                }
            }
        })
    }
}

/// The three limiters guarding caller-initiated operations.
pub struct ChannelGuards {
    /// Connection attempts, keyed by remote address.
    pub connection: Arc<FixedWindowLimiter>,
    /// Inbound frames, keyed by connection ID.
    pub message: Arc<FixedWindowLimiter>,
    /// Join/leave requests, keyed by remote address.
    pub subscription: Arc<FixedWindowLimiter>,
    sweep_interval: Duration,
}

impl ChannelGuards {
    /// Build the limiters from settings.
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            connection: Arc::new(FixedWindowLimiter::from_rule("connection", settings.connection)),
            message: Arc::new(FixedWindowLimiter::from_rule("message", settings.message)),
            subscription: Arc::new(FixedWindowLimiter::from_rule(
                "subscription",
                settings.subscription,
            )),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
        }
    }

    /// Start one sweeper per limiter.
    pub fn spawn_sweepers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        if self.sweep_interval.is_zero() {
            warn!("rate limit sweep interval is zero, sweepers not started");
            return Vec::new();
        }
        [&self.connection, &self.message, &self.subscription]
            .into_iter()
            .map(|limiter| limiter.spawn_sweeper(self.sweep_interval, cancel.child_token()))
            .collect()
    }
}
