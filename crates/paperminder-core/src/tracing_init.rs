//! Logging setup for the `PaperMinder` server binary.
//!
//! Console output by default; JSON lines (with the current span attached)
//! for log shippers. `RUST_LOG` replaces the built-in filter when it parses.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber. Call once, before the server starts.
///
/// `default_filter` applies when `RUST_LOG` is unset or invalid, for example
/// `"paperminder_server=info,tower_http=info"`.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let output = if log_json {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(output)
        .init();
}
