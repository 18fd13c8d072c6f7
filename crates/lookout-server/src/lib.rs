//! # lookout-server
//!
//! Priority-tiered delivery of agent activity to live session viewers.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `channel` | Per-session rooms, viewer connections, fan-out publish |
//! | `batching` | Per-session queues with one flush timer each |
//! | `emitter` | Status events: critical now, other tiers batched |
//! | `router` | Decisions: toast now, sidebar and silent batched |
//! | `scheduler` | Watched sessions, two polling cadences, daily archival |
//! | `rate_limit` | Fixed-window limiters for connect, message, subscribe |
//! | `collaborators` | Agent-status source and archiver traits, HTTP client |
//! | `pipeline` | Wires the components and owns the viewer lifecycle |
//! | `websocket` | Viewer gateway on `GET /ws` |
//! | `server` | Axum router: ingress API, health, metrics |
//! | `shutdown` | Cancellation token and background task tracking |
//! | `metrics` | Prometheus recorder and metric names |
//!
//! ## Crate Position
//!
//! Depends on `lookout-core` and `lookout-settings`. Depended on by the
//! `lookout` binary.

#![deny(unsafe_code)]

pub mod batching;
pub mod channel;
pub mod collaborators;
pub mod emitter;
pub mod metrics;
pub mod pipeline;
pub mod rate_limit;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use emitter::{EmitOutcome, StatusEmitter};
pub use pipeline::Pipeline;
pub use router::{DecisionRouter, RouteOutcome};
pub use scheduler::SessionScheduler;
pub use server::LookoutServer;
