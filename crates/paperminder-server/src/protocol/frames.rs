//! Frame decoding and encoding.
//!
//! Inbound frames carry no single reliable discriminator, so decoding checks
//! a fixed priority: a `printer_name` field makes a subscription, a firmware
//! `kind` makes a firmware report, and anything else must be a message.

use paperminder_core::db::unix_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::storage::UpdateChannel;

/// Maximum message body length, in characters.
pub const MAX_MESSAGE_CHARS: usize = 500;

const FIRMWARE_KINDS: &[&str] = &[
    "firmware_progress",
    "firmware_complete",
    "firmware_failed",
    "firmware_declined",
];

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Payload must be a JSON object.")]
    NotAnObject,

    #[error("{0}")]
    Invalid(String),
}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(e.to_string())
    }
}

fn default_platform() -> String {
    "esp8266".to_string()
}

fn default_firmware_version() -> String {
    "0.0.0".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_channel() -> UpdateChannel {
    UpdateChannel::Stable
}

/// A device announcing itself and its firmware state.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscribeFrame {
    pub printer_name: String,
    #[serde(default)]
    pub printer_id: Option<Uuid>,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,
    #[serde(default = "default_true")]
    pub auto_update: bool,
    #[serde(default = "default_channel")]
    pub update_channel: UpdateChannel,
}

/// Firmware lifecycle reports sent by a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FirmwareReport {
    FirmwareProgress {
        percent: i64,
        #[serde(default)]
        status: String,
    },
    FirmwareComplete {
        version: String,
    },
    FirmwareFailed {
        #[serde(default)]
        error: String,
    },
    FirmwareDeclined {
        version: String,
        #[serde(default)]
        auto_update: Option<bool>,
    },
}

/// A message addressed to another device or user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageFrame {
    pub recipient_id: Uuid,
    pub sender_name: String,
    pub message: String,
}

impl MessageFrame {
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.sender_name.trim().is_empty() {
            return Err(FrameError::Invalid("sender_name must not be empty".into()));
        }
        let len = self.message.chars().count();
        if len == 0 || len > MAX_MESSAGE_CHARS {
            return Err(FrameError::Invalid(format!(
                "message must be between 1 and {MAX_MESSAGE_CHARS} characters"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Subscribe(SubscribeFrame),
    Firmware(FirmwareReport),
    Message(MessageFrame),
}

impl ClientFrame {
    /// Decode one text frame.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        let Value::Object(map) = &value else {
            return Err(FrameError::NotAnObject);
        };

        if map.contains_key("printer_name") {
            let frame: SubscribeFrame = serde_json::from_value(value)?;
            return Ok(Self::Subscribe(frame));
        }

        let is_firmware = map
            .get("kind")
            .and_then(Value::as_str)
            .is_some_and(|k| FIRMWARE_KINDS.contains(&k));
        if is_firmware {
            let report: FirmwareReport = serde_json::from_value(value)?;
            if let FirmwareReport::FirmwareProgress { percent, .. } = &report {
                if !(-1..=100).contains(percent) {
                    return Err(FrameError::Invalid(format!(
                        "percent must be between -1 and 100, got {percent}"
                    )));
                }
            }
            return Ok(Self::Firmware(report));
        }

        let frame: MessageFrame = serde_json::from_value(value)?;
        frame.validate()?;
        Ok(Self::Message(frame))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Info,
    ValidationError,
    RecipientNotConnected,
    SubscriptionAccepted,
}

/// Frames the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        sender_name: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        number: Option<i64>,
        timestamp: i64,
    },
    FirmwareUpdate {
        version: String,
        platform: String,
        url: String,
        md5: String,
    },
    Status {
        code: StatusCode,
        detail: String,
        timestamp: i64,
    },
}

impl ServerFrame {
    pub fn status(code: StatusCode, detail: impl Into<String>) -> Self {
        Self::Status {
            code,
            detail: detail.into(),
            timestamp: unix_timestamp(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
