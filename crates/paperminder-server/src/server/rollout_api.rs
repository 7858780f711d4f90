use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::rollout::{RolloutDetail, RolloutRequest, RolloutUpdate};
use crate::storage::{Rollout, RolloutStatus};

fn parse_status(status: &str) -> Result<RolloutStatus, ApiError> {
    status.parse().map_err(ApiError::BadRequest)
}

/// `POST /api/rollouts`
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<RolloutRequest>,
) -> Result<(StatusCode, Json<Rollout>), ApiError> {
    let rollout = state.orchestrator.create(&req).await?;
    Ok((StatusCode::CREATED, Json(rollout)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
}

/// `GET /api/rollouts`
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Rollout>>, ApiError> {
    let status = params.status.as_deref().map(parse_status).transpose()?;
    Ok(Json(state.orchestrator.list(status).await?))
}

/// `GET /api/rollouts/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<RolloutDetail>, ApiError> {
    Ok(Json(state.orchestrator.get(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PatchRollout {
    pub status: Option<String>,
    pub percentage: Option<i64>,
}

/// `PATCH /api/rollouts/{id}`
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<PatchRollout>,
) -> Result<Json<Rollout>, ApiError> {
    let update = RolloutUpdate {
        status: patch.status.as_deref().map(parse_status).transpose()?,
        percentage: patch.percentage,
    };
    Ok(Json(state.orchestrator.update(id, &update).await?))
}

/// `DELETE /api/rollouts/{id}`
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
