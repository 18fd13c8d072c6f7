//! Delivery pipeline settings: scheduler, archival sweep, emitter, router.

use std::collections::HashSet;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::clamp_u64;

/// Polling cadences and the agent roles polled on each.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// High-priority tick interval (200–500 ms).
    pub high_priority_interval_ms: u64,
    /// Low-priority tick interval (1000–2000 ms).
    pub low_priority_interval_ms: u64,
    /// Roles checked on the high-priority tick.
    pub high_priority_agents: Vec<String>,
    /// Roles checked on the low-priority tick. Must not overlap the high set.
    pub low_priority_agents: Vec<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            high_priority_interval_ms: 300,
            low_priority_interval_ms: 1_500,
            high_priority_agents: ["orchestrator", "planner", "coder", "tester"]
                .map(String::from)
                .to_vec(),
            low_priority_agents: ["reviewer", "documenter", "security", "deployer"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl SchedulerSettings {
    /// High-priority tick interval.
    pub fn high_priority_interval(&self) -> Duration {
        Duration::from_millis(self.high_priority_interval_ms)
    }

    /// Low-priority tick interval.
    pub fn low_priority_interval(&self) -> Duration {
        Duration::from_millis(self.low_priority_interval_ms)
    }

    pub(crate) fn validate(&mut self) {
        clamp_u64(
            &mut self.high_priority_interval_ms,
            200,
            500,
            "scheduler.high_priority_interval_ms",
        );
        clamp_u64(
            &mut self.low_priority_interval_ms,
            1_000,
            2_000,
            "scheduler.low_priority_interval_ms",
        );
        let high: HashSet<&str> = self.high_priority_agents.iter().map(String::as_str).collect();
        let before = self.low_priority_agents.len();
        self.low_priority_agents.retain(|a| !high.contains(a.as_str()));
        if self.low_priority_agents.len() != before {
            tracing::warn!("low_priority_agents overlapped high_priority_agents, duplicates dropped");
        }
    }
}

/// Once-daily cold-storage sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArchivalSettings {
    /// Whether the daily sweep runs at all (manual trigger is always available).
    pub enabled: bool,
    /// UTC wall-clock time of the sweep, `"HH:MM"`.
    pub sweep_time: String,
    /// Sessions ended longer ago than this are archived.
    pub retention_days: u32,
    /// Directory archive paths are built under.
    pub archive_dir: String,
}

const DEFAULT_SWEEP_TIME: &str = "03:00";

impl Default for ArchivalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_time: DEFAULT_SWEEP_TIME.to_string(),
            retention_days: 30,
            archive_dir: "archive".to_string(),
        }
    }
}

impl ArchivalSettings {
    /// Parsed sweep time; falls back to 03:00 when unparseable.
    pub fn sweep_time(&self) -> NaiveTime {
        parse_sweep_time(&self.sweep_time)
            .or_else(|| parse_sweep_time(DEFAULT_SWEEP_TIME))
            .unwrap_or(NaiveTime::MIN)
    }

    pub(crate) fn validate(&mut self) {
        if parse_sweep_time(&self.sweep_time).is_none() {
            tracing::warn!(
                "archival.sweep_time {:?} is not HH:MM, using {DEFAULT_SWEEP_TIME}",
                self.sweep_time
            );
            self.sweep_time = DEFAULT_SWEEP_TIME.to_string();
        }
        if self.retention_days == 0 {
            tracing::warn!("archival.retention_days is 0, raising to 1");
            self.retention_days = 1;
        }
    }
}

fn parse_sweep_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

/// Status emitter delay budgets and batching.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmitterSettings {
    /// Added delay budget for `high` events.
    pub high_delay_ms: u64,
    /// Added delay budget for `medium` events.
    pub medium_delay_ms: u64,
    /// Added delay budget for `low` events.
    pub low_delay_ms: u64,
    /// Queue length that forces an immediate flush.
    pub batch_size: usize,
    /// Queues older than this are force-flushed by the safety sweep.
    pub stale_after_ms: u64,
}

impl Default for EmitterSettings {
    fn default() -> Self {
        Self {
            high_delay_ms: 300,
            medium_delay_ms: 800,
            low_delay_ms: 1_500,
            batch_size: 10,
            stale_after_ms: 10_000,
        }
    }
}

impl EmitterSettings {
    pub(crate) fn validate(&mut self) {
        clamp_u64(&mut self.high_delay_ms, 1, 500, "emitter.high_delay_ms");
        clamp_u64(&mut self.medium_delay_ms, 1, 1_000, "emitter.medium_delay_ms");
        clamp_u64(&mut self.low_delay_ms, 1, 2_000, "emitter.low_delay_ms");
        if self.batch_size == 0 {
            tracing::warn!("emitter.batch_size is 0, raising to 1");
            self.batch_size = 1;
        }
        let floor = self.low_delay_ms.max(self.medium_delay_ms).max(self.high_delay_ms) * 2;
        clamp_u64(&mut self.stale_after_ms, floor, u64::MAX, "emitter.stale_after_ms");
    }
}

/// Decision router batching and latency threshold.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterSettings {
    /// Batch window for `medium`/`low` decisions.
    pub batch_delay_ms: u64,
    /// Queue length that forces an immediate flush.
    pub batch_size: usize,
    /// Immediate deliveries slower than this log a warning.
    pub latency_warn_ms: u64,
    /// Queues older than this are force-flushed by the safety sweep.
    pub stale_after_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            batch_delay_ms: 500,
            batch_size: 5,
            latency_warn_ms: 100,
            stale_after_ms: 10_000,
        }
    }
}

impl RouterSettings {
    pub(crate) fn validate(&mut self) {
        clamp_u64(&mut self.batch_delay_ms, 1, 2_000, "router.batch_delay_ms");
        if self.batch_size == 0 {
            tracing::warn!("router.batch_size is 0, raising to 1");
            self.batch_size = 1;
        }
        clamp_u64(
            &mut self.stale_after_ms,
            self.batch_delay_ms * 2,
            u64::MAX,
            "router.stale_after_ms",
        );
    }
}
