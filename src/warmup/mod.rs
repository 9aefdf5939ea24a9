//! Asset cache warmup
//!
//! Parses the configured warm targets and runs the background scheduler
//! that keeps their creatives on disk.

mod scheduler;
mod target;

pub use scheduler::{WarmupConfig, WarmupScheduler};
pub use target::{parse_warm_targets, WarmTarget, WarmTargetDefaults};
