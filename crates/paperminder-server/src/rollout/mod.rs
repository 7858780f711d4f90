//! Firmware rollout campaigns: targeting, bucketing, and the orchestrator.

mod orchestrator;
pub mod targeting;

pub use orchestrator::*;
pub use targeting::{bucket_for, should_update_now, TargetSpec};
