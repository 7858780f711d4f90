use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::instrument;

use super::{ApiError, AppState};
use crate::firmware::UploadRequest;
use crate::storage::{FirmwareArtifact, UpdateChannel};

fn default_channel() -> String {
    UpdateChannel::Stable.as_str().to_string()
}

fn parse_channel(channel: &str) -> Result<UpdateChannel, ApiError> {
    channel.parse().map_err(ApiError::BadRequest)
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub version: String,
    pub platform: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub mandatory: bool,
    pub release_notes: Option<String>,
    pub changelog: Option<String>,
    pub min_upgrade_version: Option<String>,
}

/// `POST /api/firmware` with the raw image as the body.
#[instrument(skip_all, fields(version = %params.version, platform = %params.platform))]
pub async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<FirmwareArtifact>), ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("Firmware image is empty".into()));
    }

    let artifact = state
        .catalog
        .upload(&UploadRequest {
            version: &params.version,
            platform: &params.platform,
            channel: &params.channel,
            data: &body,
            release_notes: params.release_notes.as_deref(),
            changelog: params.changelog.as_deref(),
            mandatory: params.mandatory,
            min_upgrade_version: params.min_upgrade_version.as_deref(),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(artifact)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub channel: Option<String>,
    pub platform: Option<String>,
}

/// `GET /api/firmware`
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<FirmwareArtifact>>, ApiError> {
    let channel = params.channel.as_deref().map(parse_channel).transpose()?;
    let artifacts = state
        .catalog
        .list(channel, params.platform.as_deref())
        .await?;
    Ok(Json(artifacts))
}

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    #[serde(default = "default_channel")]
    pub channel: String,
    pub platform: String,
}

/// `GET /api/firmware/latest`
pub async fn latest(
    State(state): State<AppState>,
    Query(params): Query<LatestParams>,
) -> Result<Json<FirmwareArtifact>, ApiError> {
    let channel = parse_channel(&params.channel)?;
    state
        .catalog
        .latest(channel, &params.platform)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "No firmware for channel {channel} and platform {}",
                params.platform
            ))
        })
}

fn not_found(platform: &str, version: &str) -> ApiError {
    ApiError::NotFound(format!("Firmware {version} for {platform} not found"))
}

/// `GET /api/firmware/{platform}/{version}`
pub async fn get(
    State(state): State<AppState>,
    Path((platform, version)): Path<(String, String)>,
) -> Result<Json<FirmwareArtifact>, ApiError> {
    state
        .catalog
        .get(&version, &platform)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(&platform, &version))
}

/// `POST /api/firmware/{platform}/{version}/deprecate`
pub async fn deprecate(
    State(state): State<AppState>,
    Path((platform, version)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.catalog.deprecate(&version, &platform).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&platform, &version))
    }
}

/// `GET /api/firmware/download/{platform}/{version}`
#[instrument(skip_all, fields(platform = %platform, version = %version))]
pub async fn download(
    State(state): State<AppState>,
    Path((platform, version)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (artifact, data) = state
        .catalog
        .download(&version, &platform)
        .await?
        .ok_or_else(|| not_found(&platform, &version))?;

    let disposition = format!(
        "attachment; filename=\"paperminder-{}-{}.bin\"",
        artifact.platform, artifact.version
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (header::HeaderName::from_static("content-md5"), artifact.md5),
        ],
        data,
    )
        .into_response())
}
