//! Data models for `PaperMinder` storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

/// Update channel a device follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UpdateChannel {
    Stable,
    Beta,
    Canary,
}

impl UpdateChannel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Canary => "canary",
        }
    }
}

impl FromStr for UpdateChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "canary" => Ok(Self::Canary),
            other => Err(format!("unknown update channel {other:?}")),
        }
    }
}

impl fmt::Display for UpdateChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub owner_id: Option<String>,
    pub name: String,
    pub platform: String,
    pub firmware_version: String,
    pub update_channel: UpdateChannel,
    pub auto_update: bool,
    pub online: bool,
    pub last_connected: Option<i64>,
    pub last_ip: Option<String>,
    #[serde(skip)]
    pub daily_message_number: i64,
    #[serde(skip)]
    pub daily_message_day: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A message staged for a recipient without a live connection.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CachedMessage {
    pub id: i64,
    pub recipient_id: String,
    pub sender_id: Option<String>,
    pub sender_name: String,
    pub message: String,
    pub delivered: bool,
    pub created_at: i64,
    pub delivered_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageLog {
    pub id: i64,
    pub sender_id: Option<String>,
    pub recipient_id: String,
    pub sender_name: String,
    pub message: String,
    pub created_at: i64,
}

/// Firmware artifact metadata. The binary itself is loaded separately.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FirmwareArtifact {
    pub id: i64,
    pub version: String,
    pub platform: String,
    pub channel: UpdateChannel,
    pub size: i64,
    pub md5: String,
    pub sha256: Option<String>,
    pub release_notes: Option<String>,
    pub changelog: Option<String>,
    pub mandatory: bool,
    pub min_upgrade_version: Option<String>,
    pub released_at: i64,
    pub deprecated_at: Option<i64>,
    pub download_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RolloutType {
    Immediate,
    Gradual,
    Scheduled,
}

impl FromStr for RolloutType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "gradual" => Ok(Self::Gradual),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(format!("unknown rollout type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RolloutStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl RolloutStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl FromStr for RolloutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown rollout status {other:?}")),
        }
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Rollout {
    pub id: i64,
    pub firmware_version: String,
    pub rollout_type: RolloutType,
    pub percentage: i64,
    pub scheduled_at: Option<i64>,
    pub target_all: bool,
    pub target_user_ids: Json<Vec<String>>,
    pub target_device_ids: Json<Vec<String>>,
    pub target_channels: Json<Vec<UpdateChannel>>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub status: RolloutStatus,
    pub total_targets: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub declined_count: i64,
    pub pending_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Declined,
}

impl AttemptStatus {
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Downloading)
    }
}

/// One device's attempt at installing one firmware version.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UpdateAttempt {
    pub id: i64,
    pub device_id: String,
    pub rollout_id: Option<i64>,
    pub firmware_version: String,
    pub platform: String,
    pub status: AttemptStatus,
    pub last_percent: i64,
    pub status_message: Option<String>,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}
