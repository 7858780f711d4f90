//! Rollout orchestrator.
//!
//! Validates and creates rollout campaigns, resolves their target set, and
//! offers the firmware to every matching device that is connected right now.
//! Devices that connect later are picked up by the session's update check.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use paperminder_core::version::{Version, VersionError};

use super::targeting::TargetSpec;
use crate::delivery::DeliveryEngine;
use crate::firmware::{CatalogError, FirmwareCatalog};
use crate::protocol::ServerFrame;
use crate::storage::{
    Database, DatabaseError, DeviceFilter, FirmwareArtifact, NewRollout, Rollout,
    RolloutStatus, RolloutType, UpdateAttempt, UpdateChannel,
};
use crate::updates::{TrackerError, UpdateTracker};

#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error("Invalid rollout type: {0}")]
    InvalidType(String),

    #[error("Percentage {value} is outside {min}..=100")]
    InvalidPercentage { value: i64, min: i64 },

    #[error("Scheduled rollouts require scheduled_at")]
    MissingSchedule,

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] VersionError),

    #[error("No firmware uploaded for version {0}")]
    UnknownFirmware(String),

    #[error("Rollout {0} not found")]
    NotFound(i64),

    #[error("Cannot move rollout from {from} to {to}")]
    InvalidTransition {
        from: RolloutStatus,
        to: RolloutStatus,
    },

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Operator request to start a rollout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RolloutRequest {
    pub firmware_version: String,
    pub rollout_type: String,
    #[serde(default)]
    pub percentage: Option<i64>,
    #[serde(default)]
    pub scheduled_at: Option<i64>,
    #[serde(default)]
    pub target_all: bool,
    #[serde(default)]
    pub target_user_ids: Vec<String>,
    #[serde(default)]
    pub target_device_ids: Vec<String>,
    #[serde(default)]
    pub target_channels: Vec<String>,
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub max_version: Option<String>,
}

/// Operator changes to an existing rollout. Absent fields are left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolloutUpdate {
    pub status: Option<RolloutStatus>,
    pub percentage: Option<i64>,
}

/// A rollout together with its per-device attempts.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutDetail {
    #[serde(flatten)]
    pub rollout: Rollout,
    pub targets: Vec<UpdateAttempt>,
}

/// Whether a rollout may move from `from` to `to`.
pub const fn can_transition(from: RolloutStatus, to: RolloutStatus) -> bool {
    use RolloutStatus::{Active, Cancelled, Completed, Paused, Pending};
    matches!(
        (from, to),
        (Pending, Active | Cancelled) | (Active | Paused, Completed | Cancelled) | (Active, Paused) | (Paused, Active)
    )
}

#[derive(Clone)]
pub struct RolloutOrchestrator {
    db: Database,
    catalog: FirmwareCatalog,
    delivery: DeliveryEngine,
    tracker: UpdateTracker,
}

impl RolloutOrchestrator {
    pub const fn new(
        db: Database,
        catalog: FirmwareCatalog,
        delivery: DeliveryEngine,
        tracker: UpdateTracker,
    ) -> Self {
        Self {
            db,
            catalog,
            delivery,
            tracker,
        }
    }

    /// Validate, persist and activate a rollout, then offer it to every
    /// connected target.
    #[instrument(skip_all, fields(version = %req.firmware_version, rollout_type = %req.rollout_type))]
    pub async fn create(&self, req: &RolloutRequest) -> Result<Rollout, RolloutError> {
        let rollout_type: RolloutType = req
            .rollout_type
            .parse()
            .map_err(|_| RolloutError::InvalidType(req.rollout_type.clone()))?;

        let percentage = match (rollout_type, req.percentage) {
            (RolloutType::Gradual, Some(p)) if (1..=100).contains(&p) => p,
            (RolloutType::Gradual, value) => {
                return Err(RolloutError::InvalidPercentage {
                    value: value.unwrap_or(0),
                    min: 1,
                });
            }
            (_, Some(p)) if !(0..=100).contains(&p) => {
                return Err(RolloutError::InvalidPercentage { value: p, min: 0 });
            }
            (_, p) => p.unwrap_or(100),
        };
        if rollout_type == RolloutType::Scheduled && req.scheduled_at.is_none() {
            return Err(RolloutError::MissingSchedule);
        }

        let firmware_version = Version::parse(&req.firmware_version)?;
        for bound in [&req.min_version, &req.max_version].into_iter().flatten() {
            Version::parse(bound)?;
        }
        let channels = req
            .target_channels
            .iter()
            .map(|c| c.parse::<UpdateChannel>().map_err(|_| RolloutError::InvalidChannel(c.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let has_firmware = self
            .catalog
            .list(None, None)
            .await?
            .iter()
            .any(|a| a.version == firmware_version.as_str());
        if !has_firmware {
            return Err(RolloutError::UnknownFirmware(firmware_version.to_string()));
        }

        let rollout = self
            .db
            .create_rollout(&NewRollout {
                firmware_version: firmware_version.as_str(),
                rollout_type,
                percentage,
                scheduled_at: req.scheduled_at,
                target_all: req.target_all,
                target_user_ids: &req.target_user_ids,
                target_device_ids: &req.target_device_ids,
                target_channels: &channels,
                min_version: req.min_version.as_deref(),
                max_version: req.max_version.as_deref(),
            })
            .await?;

        let devices = self.db.list_devices(&DeviceFilter::default()).await?;
        let targets = TargetSpec::from_rollout(&rollout).resolve(&devices).len();
        let total = i64::try_from(targets).unwrap_or(i64::MAX);
        self.db.set_rollout_targets(rollout.id, total).await?;
        self.db
            .update_rollout_status(rollout.id, RolloutStatus::Active)
            .await?;

        let rollout = self.db.get_rollout(rollout.id).await?;
        let offered = self.sweep(&rollout).await?;
        info!(rollout_id = rollout.id, targets, offered, "Rollout created");
        Ok(rollout)
    }

    /// Offer `rollout` to every connected device it admits now.
    ///
    /// Eligibility is the same update check a device gets when it
    /// subscribes: a device is offered this rollout only when that check
    /// picks it. Returns how many devices were sent an update frame.
    pub async fn sweep(&self, rollout: &Rollout) -> Result<usize, RolloutError> {
        let mut offered = 0;

        for identity in self.delivery.registry().connected_identities().await {
            let device_id = identity.to_string();
            let update = match self.tracker.check_for_updates(&device_id).await {
                Ok(Some(update)) => update,
                Ok(None) | Err(TrackerError::UnknownDevice(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if update.rollout.id != rollout.id {
                debug!(
                    device_id = %device_id,
                    rollout_id = update.rollout.id,
                    "Device is eligible through another rollout, skipping"
                );
                continue;
            }

            if self.offer(identity, &update.artifact, rollout.id).await? > 0 {
                offered += 1;
            }
        }

        Ok(offered)
    }

    /// Open an attempt for the device and push the update frame to all of its
    /// connections. Returns how many connections accepted the frame.
    async fn offer(
        &self,
        identity: Uuid,
        artifact: &FirmwareArtifact,
        rollout_id: i64,
    ) -> Result<usize, RolloutError> {
        let device_id = identity.to_string();
        self.tracker
            .open_attempt(&device_id, &artifact.version, &artifact.platform, Some(rollout_id))
            .await?;
        let sent = self
            .delivery
            .push_frame(identity, &self.update_frame(artifact))
            .await;
        if sent == 0 {
            warn!(device_id = %device_id, version = %artifact.version, "Update frame not accepted by any connection");
        }
        Ok(sent)
    }

    /// The frame that tells a device to fetch `artifact`.
    pub fn update_frame(&self, artifact: &FirmwareArtifact) -> ServerFrame {
        ServerFrame::FirmwareUpdate {
            version: artifact.version.clone(),
            platform: artifact.platform.clone(),
            url: self.catalog.download_url(artifact),
            md5: artifact.md5.clone(),
        }
    }

    pub async fn get(&self, id: i64) -> Result<RolloutDetail, RolloutError> {
        let rollout = self.rollout(id).await?;
        let targets = self.db.list_attempts_for_rollout(id).await?;
        Ok(RolloutDetail { rollout, targets })
    }

    pub async fn list(&self, status: Option<RolloutStatus>) -> Result<Vec<Rollout>, RolloutError> {
        Ok(self.db.list_rollouts(status).await?)
    }

    /// Move a rollout to `to`. Targets are not recomputed.
    #[instrument(skip(self))]
    pub async fn transition(&self, id: i64, to: RolloutStatus) -> Result<Rollout, RolloutError> {
        let rollout = self.rollout(id).await?;
        if !can_transition(rollout.status, to) {
            return Err(RolloutError::InvalidTransition {
                from: rollout.status,
                to,
            });
        }
        self.db.update_rollout_status(id, to).await?;
        info!(from = %rollout.status, "Rollout status changed");
        self.rollout(id).await
    }

    pub async fn set_percentage(&self, id: i64, percentage: i64) -> Result<Rollout, RolloutError> {
        if !(0..=100).contains(&percentage) {
            return Err(RolloutError::InvalidPercentage {
                value: percentage,
                min: 0,
            });
        }
        if !self.db.update_rollout_percentage(id, percentage).await? {
            return Err(RolloutError::NotFound(id));
        }
        info!(rollout_id = id, percentage, "Rollout percentage changed");
        self.rollout(id).await
    }

    /// Apply an operator update: percentage first, then status.
    ///
    /// A status equal to the current one is not a transition and is skipped.
    pub async fn update(&self, id: i64, update: &RolloutUpdate) -> Result<Rollout, RolloutError> {
        let mut rollout = self.rollout(id).await?;
        if let Some(percentage) = update.percentage {
            rollout = self.set_percentage(id, percentage).await?;
        }
        if let Some(status) = update.status {
            if status != rollout.status {
                rollout = self.transition(id, status).await?;
            }
        }
        Ok(rollout)
    }

    pub async fn delete(&self, id: i64) -> Result<(), RolloutError> {
        if !self.db.delete_rollout(id).await? {
            return Err(RolloutError::NotFound(id));
        }
        info!(rollout_id = id, "Rollout deleted");
        Ok(())
    }

    async fn rollout(&self, id: i64) -> Result<Rollout, RolloutError> {
        match self.db.get_rollout(id).await {
            Ok(r) => Ok(r),
            Err(DatabaseError::NotFound(_)) => Err(RolloutError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}
