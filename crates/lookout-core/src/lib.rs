//! # lookout-core
//!
//! Foundation types shared by every Lookout crate.
//!
//! - **Agents**: [`agents::AgentStatus`], [`agents::AgentState`], [`agents::SessionSummary`]
//! - **Priorities**: [`events::PriorityTier`] and the [`events::NotificationRoute`] it selects
//! - **Events**: [`events::StatusEvent`], [`events::DecisionEvent`], [`events::QueuedEvent`],
//!   and the [`events::ChannelEvent`] wire envelope published to viewers
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` stack
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `lookout-server` and the `lookout` binary.

#![deny(unsafe_code)]

pub mod agents;
pub mod events;
pub mod logging;
