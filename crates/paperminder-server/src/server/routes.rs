use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::{firmware_api, message_api, printer_api, rollout_api, ws, AppState};

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the complete HTTP + WebSocket router.
pub fn build_router(state: AppState) -> Router {
    // One byte over the limit still reaches the catalog, which reports it.
    let upload_limit = state.config.max_firmware_size.saturating_add(1);

    Router::new()
        .route("/health", get(health))
        .route("/ws/{identity}", get(ws::ws_handler))
        .route("/api/message", post(message_api::send_message))
        .route(
            "/api/firmware",
            get(firmware_api::list)
                .post(firmware_api::upload)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/firmware/latest", get(firmware_api::latest))
        .route(
            "/api/firmware/download/{platform}/{version}",
            get(firmware_api::download),
        )
        .route("/api/firmware/{platform}/{version}", get(firmware_api::get))
        .route(
            "/api/firmware/{platform}/{version}/deprecate",
            post(firmware_api::deprecate),
        )
        .route(
            "/api/rollouts",
            get(rollout_api::list).post(rollout_api::create),
        )
        .route(
            "/api/rollouts/{id}",
            get(rollout_api::get)
                .patch(rollout_api::update)
                .delete(rollout_api::delete),
        )
        .route("/api/printers", get(printer_api::list_printers))
        .route("/api/printers/{id}", get(printer_api::get_printer))
        .route("/api/printers/{id}/updates", get(printer_api::update_history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
