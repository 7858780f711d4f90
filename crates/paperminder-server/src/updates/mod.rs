//! Per-device firmware update lifecycle.

mod tracker;

pub use tracker::*;
