//! Mapping of component errors onto HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::delivery::DeliveryError;
use crate::firmware::CatalogError;
use crate::rollout::RolloutError;
use crate::storage::DatabaseError;
use crate::updates::TrackerError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    /// Never shown to the client.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let detail = match self {
            Self::Internal(msg) => {
                error!(error = %msg, "Request failed");
                "Internal server error".to_string()
            }
            Self::BadRequest(msg) | Self::NotFound(msg) | Self::PayloadTooLarge(msg) => msg,
        };

        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<DeliveryError> for ApiError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::RecipientUnknown(id) => {
                Self::NotFound(format!("Recipient '{id}' is not registered."))
            }
            e @ DeliveryError::Unprintable(_) => Self::BadRequest(e.to_string()),
            DeliveryError::Storage(e) => e.into(),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::TooLarge { .. } => Self::PayloadTooLarge(e.to_string()),
            CatalogError::Storage(e) => e.into(),
            CatalogError::InvalidVersion(_)
            | CatalogError::InvalidChannel(_)
            | CatalogError::InvalidPlatform
            | CatalogError::UnsupportedPlatform(_)
            | CatalogError::DuplicateVersion { .. } => Self::BadRequest(e.to_string()),
        }
    }
}

impl From<TrackerError> for ApiError {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::UnknownDevice(id) => Self::NotFound(format!("Printer '{id}' not found")),
            TrackerError::Catalog(e) => e.into(),
            TrackerError::Storage(e) => e.into(),
        }
    }
}

impl From<RolloutError> for ApiError {
    fn from(e: RolloutError) -> Self {
        match e {
            RolloutError::NotFound(_) => Self::NotFound(e.to_string()),
            RolloutError::Catalog(e) => e.into(),
            RolloutError::Tracker(e) => e.into(),
            RolloutError::Storage(e) => e.into(),
            RolloutError::InvalidType(_)
            | RolloutError::InvalidPercentage { .. }
            | RolloutError::MissingSchedule
            | RolloutError::InvalidChannel(_)
            | RolloutError::InvalidVersion(_)
            | RolloutError::UnknownFirmware(_)
            | RolloutError::InvalidTransition { .. } => Self::BadRequest(e.to_string()),
        }
    }
}
