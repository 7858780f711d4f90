//! `PaperMinder` Server Library
//!
//! Core functionality for the `PaperMinder` printer backend:
//! - `SQLite` storage for devices, offline messages, firmware and rollouts
//! - Connection registry for live printer and app sockets
//! - Message delivery with an offline cache and daily numbering
//! - Firmware catalog, rollout orchestration and update tracking
//! - HTTP and WebSocket surface

pub mod delivery;
pub mod firmware;
pub mod protocol;
pub mod registry;
pub mod rollout;
pub mod server;
pub mod session;
pub mod storage;
pub mod updates;
