//! # lookout-settings
//!
//! Configuration for the Lookout delivery pipeline.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`LookoutSettings::default()`]
//! 2. **Settings file**: `~/.lookout/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `LOOKOUT_*` overrides (highest priority)
//!
//! There is no global settings cache: the host loads settings once and
//! passes the relevant sections to each component it constructs.
//!
//! # Usage
//!
//! ```no_run
//! use lookout_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("high-priority poll: {:?}", settings.scheduler.high_priority_interval());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
