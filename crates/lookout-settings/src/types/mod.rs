//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

mod limits;
mod pipeline;
mod server;

pub use limits::*;
pub use pipeline::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings for the Lookout service.
///
/// ```json
/// {
///   "server": { "port": 9400 },
///   "scheduler": { "highPriorityIntervalMs": 250 },
///   "rateLimits": { "message": { "windowMs": 1000, "max": 40 } }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LookoutSettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// External service layer connection.
    pub collaborator: CollaboratorSettings,
    /// Polling cadences and agent role sets.
    pub scheduler: SchedulerSettings,
    /// Daily cold-storage sweep.
    pub archival: ArchivalSettings,
    /// Status emitter delay budgets and batching.
    pub emitter: EmitterSettings,
    /// Decision router batching and latency threshold.
    pub router: RouterSettings,
    /// Per-operation caller rate limits.
    pub rate_limits: RateLimitSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl LookoutSettings {
    /// Clamp out-of-range values and repair broken invariants.
    ///
    /// Called automatically during loading. Bad values are corrected with a
    /// warning rather than rejected.
    pub fn validate(&mut self) {
        self.scheduler.validate();
        self.archival.validate();
        self.emitter.validate();
        self.router.validate();
        self.rate_limits.validate();
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Clamp `val` into `[min, max]`, warning when it moved.
pub(crate) fn clamp_u64(val: &mut u64, min: u64, max: u64, name: &str) {
    if *val < min || *val > max {
        let clamped = (*val).clamp(min, max);
        tracing::warn!("{name} out of range ({val}), clamped to {clamped}");
        *val = clamped;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
