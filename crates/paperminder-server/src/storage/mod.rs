//! SQLite storage for the `PaperMinder` server.
//!
//! Provides persistence for users, devices, the offline message cache and
//! audit log, firmware artifacts, rollouts, and per-device update attempts.

mod db;
mod models;
mod queries;
mod queries_firmware;
mod queries_messages;
mod queries_rollouts;

#[cfg(test)]
mod tests;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries::DeviceFilter;
pub use queries_firmware::NewArtifact;
pub use queries_rollouts::{AttemptOutcome, NewRollout};
