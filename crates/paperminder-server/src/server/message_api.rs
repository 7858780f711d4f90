use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::delivery::{DeliveryOutcome, OutgoingMessage};
use crate::protocol::MessageFrame;

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub sender_id: Option<Uuid>,
    pub recipient_id: Uuid,
    pub sender_name: String,
    pub message: String,
}

/// `POST /api/message`
#[instrument(skip_all, fields(recipient = %req.recipient_id))]
pub async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<MessageRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let frame = MessageFrame {
        recipient_id: req.recipient_id,
        sender_name: req.sender_name,
        message: req.message,
    };
    frame
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let outgoing = OutgoingMessage {
        sender_id: req.sender_id,
        sender_name: frame.sender_name,
        body: frame.message,
    };

    match state.delivery.deliver(frame.recipient_id, &outgoing).await? {
        DeliveryOutcome::Delivered {
            connections,
            number,
        } => Ok((
            StatusCode::OK,
            Json(json!({ "status": "sent", "connections": connections, "number": number })),
        )),
        DeliveryOutcome::RecipientOffline { .. } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted_for_processing" })),
        )),
    }
}
