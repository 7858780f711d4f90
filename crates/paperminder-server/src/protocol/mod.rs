//! JSON frames exchanged over a device or operator WebSocket.

mod frames;

pub use frames::*;
