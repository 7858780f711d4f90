//! `PaperMinder` Server
//!
//! HTTP + WebSocket backend for thermal printers: message relay, offline
//! cache and firmware rollouts.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use paperminder_core::config::{database_path, load_config};
use paperminder_core::tracing_init::init_tracing;
use paperminder_server::server::{build_router, AppState};
use paperminder_server::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "paperminder-server")]
#[command(version, about = "PaperMinder server - printer messaging and firmware rollouts")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8000", env = "PAPERMINDER_ADDR")]
    addr: SocketAddr,

    /// Path to SQLite database file.
    #[arg(long, env = "PAPERMINDER_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Public base URL used in firmware download links.
    #[arg(long, env = "PAPERMINDER_BASE_URL")]
    base_url: Option<String>,

    /// Path to a JSON settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("paperminder_server=info,tower_http=info", args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        base_url = %config.base_url,
        "Starting paperminder-server"
    );

    let db_path = match args.db_path {
        Some(path) => path,
        None => database_path().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?,
    };
    info!(path = %db_path.display(), "Opening server database");
    let db = Database::open(&db_path).await?;

    let state = AppState::new(db, config);

    // Spawn background task to purge delivered offline messages
    let cleanup_delivery = state.delivery.clone();
    let retention_days = state.config.cache_retention_days;
    let cleanup_interval = Duration::from_secs(state.config.cache_cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            if let Err(e) = cleanup_delivery.purge(retention_days).await {
                warn!(error = %e, "Background offline cache purge failed");
            }
        }
    });

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!(addr = %args.addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
        }
    })
    .await?;

    info!("Server stopped");
    Ok(())
}
