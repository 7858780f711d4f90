//! In-memory bookkeeping of live device and operator connections.

mod connection;

pub use connection::*;
