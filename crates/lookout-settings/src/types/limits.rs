//! Caller rate-limit settings.

use serde::{Deserialize, Serialize};

use super::clamp_u64;

/// One fixed-window rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitRule {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Calls allowed per window.
    pub max: u32,
}

impl LimitRule {
    /// Build a rule.
    pub const fn new(window_ms: u64, max: u32) -> Self {
        Self { window_ms, max }
    }

    fn validate(&mut self, name: &str) {
        clamp_u64(&mut self.window_ms, 1, u64::MAX, &format!("{name}.window_ms"));
        if self.max == 0 {
            tracing::warn!("{name}.max is 0, raising to 1");
            self.max = 1;
        }
    }
}

/// Rate limits for the three guarded caller operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// Connection attempts per remote address.
    pub connection: LimitRule,
    /// Inbound messages per connection.
    pub message: LimitRule,
    /// Join/leave subscription changes per remote address.
    pub subscription: LimitRule,
    /// How often expired entries are swept, in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            connection: LimitRule::new(60_000, 10),
            message: LimitRule::new(1_000, 20),
            subscription: LimitRule::new(60_000, 50),
            sweep_interval_ms: 60_000,
        }
    }
}

impl RateLimitSettings {
    pub(crate) fn validate(&mut self) {
        self.connection.validate("rate_limits.connection");
        self.message.validate("rate_limits.message");
        self.subscription.validate("rate_limits.subscription");
        clamp_u64(
            &mut self.sweep_interval_ms,
            1_000,
            3_600_000,
            "rate_limits.sweep_interval_ms",
        );
    }
}
