//! HTTP and WebSocket surface.

mod error;
mod firmware_api;
mod message_api;
mod printer_api;
mod rollout_api;
mod routes;
mod state;
mod ws;

pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;
