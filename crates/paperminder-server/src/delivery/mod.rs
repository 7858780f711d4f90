//! Message routing to live connections with offline staging.

mod engine;

pub use engine::*;
