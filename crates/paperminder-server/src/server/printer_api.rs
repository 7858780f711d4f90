use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::storage::{Device, DeviceFilter, UpdateAttempt, UpdateChannel};

const DEFAULT_HISTORY_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct PrinterQuery {
    pub owner_id: Option<String>,
    pub online: Option<bool>,
    pub channel: Option<String>,
}

/// `GET /api/printers`
pub async fn list_printers(
    State(state): State<AppState>,
    Query(query): Query<PrinterQuery>,
) -> Result<Json<Value>, ApiError> {
    let channel = query
        .channel
        .as_deref()
        .map(str::parse::<UpdateChannel>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    let printers = state
        .db
        .list_devices(&DeviceFilter {
            owner_id: query.owner_id.as_deref(),
            channel,
            online: query.online,
        })
        .await?;

    Ok(Json(json!({ "total": printers.len(), "printers": printers })))
}

/// `GET /api/printers/{id}`
pub async fn get_printer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Device>, ApiError> {
    Ok(Json(state.db.get_device(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// `GET /api/printers/{id}/updates`
pub async fn update_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<UpdateAttempt>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1000);
    Ok(Json(state.tracker.history(&id, limit).await?))
}
