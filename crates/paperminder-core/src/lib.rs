//! `PaperMinder` Core Library
//!
//! Shared functionality for the `PaperMinder` server:
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Layered server configuration
//! - Firmware version parsing and ordering
//! - Message sanitisation for thermal printers
//! - Hardware platform normalisation
//! - Common error types and tracing setup

pub mod config;
pub mod db;
pub mod error;
pub mod platform;
pub mod sanitize;
pub mod tracing_init;
pub mod version;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use version::{Version, VersionError};
