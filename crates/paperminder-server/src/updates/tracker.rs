//! Update state tracker.
//!
//! Records each device's update attempt as it moves from `pending` through
//! `downloading` to a terminal status. Terminal transitions update the owning
//! rollout's counters in the same transaction, and feed success and failure
//! statistics back to the firmware catalog.

use paperminder_core::db::unix_timestamp;
use paperminder_core::version;
use tracing::{debug, info, instrument, warn};

use crate::firmware::{CatalogError, FirmwareCatalog};
use crate::rollout::targeting::{should_update_now, TargetSpec};
use crate::storage::{
    AttemptOutcome, Database, DatabaseError, Device, FirmwareArtifact, Rollout, UpdateAttempt,
};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Result of applying a device report.
#[derive(Debug, Clone)]
pub enum ReportOutcome {
    Applied(UpdateAttempt),
    /// No matching attempt was open; nothing was recorded.
    Ignored,
}

/// An update the device should be offered now.
#[derive(Debug, Clone)]
pub struct AvailableUpdate {
    pub artifact: FirmwareArtifact,
    pub rollout: Rollout,
}

#[derive(Clone)]
pub struct UpdateTracker {
    db: Database,
    catalog: FirmwareCatalog,
}

impl UpdateTracker {
    pub const fn new(db: Database, catalog: FirmwareCatalog) -> Self {
        Self { db, catalog }
    }

    /// Open a `pending` attempt, reusing one already open for this version.
    pub async fn open_attempt(
        &self,
        device_id: &str,
        firmware_version: &str,
        platform: &str,
        rollout_id: Option<i64>,
    ) -> Result<UpdateAttempt, TrackerError> {
        if let Some(open) = self
            .db
            .open_attempt_for(device_id, Some(firmware_version))
            .await?
        {
            debug!(device_id, attempt_id = open.id, "Reusing open update attempt");
            return Ok(open);
        }

        let attempt = self
            .db
            .create_attempt(device_id, firmware_version, platform, rollout_id)
            .await?;
        info!(device_id, attempt_id = attempt.id, firmware_version, rollout_id, "Update attempt opened");
        Ok(attempt)
    }

    /// Apply a progress report to the device's latest open attempt.
    pub async fn progress(
        &self,
        device_id: &str,
        percent: i64,
        status_message: &str,
    ) -> Result<ReportOutcome, TrackerError> {
        match self
            .db
            .update_attempt_progress(device_id, percent, status_message)
            .await?
        {
            Some(attempt) => Ok(ReportOutcome::Applied(attempt)),
            None => {
                debug!(device_id, percent, "Progress report without an open attempt ignored");
                Ok(ReportOutcome::Ignored)
            }
        }
    }

    /// The device reports `version` installed.
    ///
    /// The device's firmware version is updated regardless; the attempt and
    /// rollout counters only move if an attempt for that version was open.
    #[instrument(skip(self))]
    pub async fn complete(&self, device_id: &str, version: &str) -> Result<ReportOutcome, TrackerError> {
        let device = self.device(device_id).await?;
        self.db.set_device_firmware_version(device_id, version).await?;

        let Some(open) = self.db.open_attempt_for(device_id, Some(version)).await? else {
            debug!("Completion without an open attempt ignored");
            return Ok(ReportOutcome::Ignored);
        };
        let Some(attempt) = self.finish(open.id, &AttemptOutcome::Completed).await? else {
            return Ok(ReportOutcome::Ignored);
        };

        if let Some(artifact) = self.catalog.get(version, &device.platform).await? {
            self.catalog.record_success(artifact.id).await;
        }
        info!(attempt_id = attempt.id, "Firmware update completed");
        Ok(ReportOutcome::Applied(attempt))
    }

    /// The device reports its update failed.
    #[instrument(skip(self))]
    pub async fn failed(&self, device_id: &str, error: &str) -> Result<ReportOutcome, TrackerError> {
        self.device(device_id).await?;

        let outcome = match self.db.open_attempt_for(device_id, None).await? {
            Some(open) => match self
                .finish(open.id, &AttemptOutcome::Failed(error.to_string()))
                .await?
            {
                Some(attempt) => ReportOutcome::Applied(attempt),
                None => ReportOutcome::Ignored,
            },
            None => ReportOutcome::Ignored,
        };

        self.attribute_failure(device_id).await;
        warn!(error, applied = matches!(outcome, ReportOutcome::Applied(_)), "Firmware update failed");
        Ok(outcome)
    }

    /// The device declined `version`. Without a pending attempt a fresh
    /// declined record is written.
    #[instrument(skip(self))]
    pub async fn declined(
        &self,
        device_id: &str,
        version: &str,
        auto_update: Option<bool>,
    ) -> Result<ReportOutcome, TrackerError> {
        let device = self.device(device_id).await?;

        if let Some(flag) = auto_update {
            self.db.set_device_auto_update(device_id, flag).await?;
        }

        if let Some(pending) = self.db.pending_attempt_for(device_id, version).await? {
            if let Some(attempt) = self.finish(pending.id, &AttemptOutcome::Declined).await? {
                info!(attempt_id = attempt.id, "Firmware update declined");
                return Ok(ReportOutcome::Applied(attempt));
            }
        }

        let attempt = self
            .db
            .insert_declined_attempt(device_id, version, &device.platform)
            .await?;
        info!(attempt_id = attempt.id, "Decline recorded without a pending attempt");
        Ok(ReportOutcome::Applied(attempt))
    }

    /// The update a device should receive now, if any.
    ///
    /// Requires auto-update, a newer non-deprecated artifact on the device's
    /// channel and platform, and an active rollout of that version that
    /// targets the device and admits it now.
    pub async fn check_for_updates(&self, device_id: &str) -> Result<Option<AvailableUpdate>, TrackerError> {
        let device = self.device(device_id).await?;
        if !device.auto_update {
            return Ok(None);
        }

        let Some(latest) = self
            .catalog
            .latest(device.update_channel, &device.platform)
            .await?
        else {
            return Ok(None);
        };
        if !version::is_newer(&latest.version, &device.firmware_version) {
            return Ok(None);
        }

        let now = unix_timestamp();
        let rollout = self
            .db
            .list_active_rollouts_for_version(&latest.version)
            .await?
            .into_iter()
            .find(|r| TargetSpec::from_rollout(r).matches(&device) && should_update_now(r, &device.id, now));

        Ok(rollout.map(|rollout| AvailableUpdate {
            artifact: latest,
            rollout,
        }))
    }

    pub async fn history(&self, device_id: &str, limit: i64) -> Result<Vec<UpdateAttempt>, TrackerError> {
        self.device(device_id).await?;
        Ok(self.db.list_attempts_for_device(device_id, limit).await?)
    }

    async fn device(&self, device_id: &str) -> Result<Device, TrackerError> {
        match self.db.get_device(device_id).await {
            Ok(d) => Ok(d),
            Err(DatabaseError::NotFound(_)) => Err(TrackerError::UnknownDevice(device_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Terminal transition; `None` if another report closed the attempt first.
    async fn finish(
        &self,
        attempt_id: i64,
        outcome: &AttemptOutcome,
    ) -> Result<Option<UpdateAttempt>, TrackerError> {
        match self.db.finish_attempt(attempt_id, outcome).await {
            Ok(attempt) => Ok(Some(attempt)),
            Err(DatabaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn attribute_failure(&self, device_id: &str) {
        let attempt = match self.db.latest_attempt_for(device_id).await {
            Ok(Some(a)) => a,
            Ok(None) => {
                warn!(device_id, "No update attempt to attribute failure to");
                return;
            }
            Err(e) => {
                warn!(device_id, error = %e, "Failed to look up attempt for failure attribution");
                return;
            }
        };

        match self.catalog.get(&attempt.firmware_version, &attempt.platform).await {
            Ok(Some(artifact)) => self.catalog.record_failure(artifact.id).await,
            Ok(None) => warn!(
                device_id,
                version = %attempt.firmware_version,
                "Failed update refers to unknown firmware"
            ),
            Err(e) => warn!(device_id, error = %e, "Failed to attribute update failure"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use paperminder_core::ServerConfig;

    use super::*;
    use crate::firmware::UploadRequest;
    use crate::storage::{AttemptStatus, NewRollout, RolloutStatus, RolloutType, UpdateChannel};

    struct Fixture {
        tracker: UpdateTracker,
        catalog: FirmwareCatalog,
        db: Database,
    }

    async fn setup() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let catalog = FirmwareCatalog::new(db.clone(), Arc::new(ServerConfig::default()));
        db.create_device("d1", None, "kitchen").await.unwrap();
        db.update_device_subscription("d1", "esp32", "1.0.0", true, UpdateChannel::Stable)
            .await
            .unwrap();
        Fixture {
            tracker: UpdateTracker::new(db.clone(), catalog.clone()),
            catalog,
            db,
        }
    }

    async fn upload(catalog: &FirmwareCatalog, version: &str) -> FirmwareArtifact {
        catalog
            .upload(&UploadRequest {
                version,
                platform: "esp32",
                channel: "stable",
                data: b"fw",
                ..UploadRequest::default()
            })
            .await
            .unwrap()
    }

    async fn active_rollout(db: &Database, version: &str, kind: RolloutType, pct: i64) -> Rollout {
        let r = db
            .create_rollout(&NewRollout {
                firmware_version: version,
                rollout_type: kind,
                percentage: pct,
                scheduled_at: None,
                target_all: true,
                target_user_ids: &[],
                target_device_ids: &[],
                target_channels: &[],
                min_version: None,
                max_version: None,
            })
            .await
            .unwrap();
        db.set_rollout_targets(r.id, 1).await.unwrap();
        db.update_rollout_status(r.id, RolloutStatus::Active).await.unwrap();
        db.get_rollout(r.id).await.unwrap()
    }

    fn applied(outcome: ReportOutcome) -> UpdateAttempt {
        match outcome {
            ReportOutcome::Applied(a) => a,
            ReportOutcome::Ignored => panic!("expected applied report"),
        }
    }

    #[tokio::test]
    async fn open_attempt_is_reused() {
        let fx = setup().await;
        let a = fx.tracker.open_attempt("d1", "2.0.0", "esp32", None).await.unwrap();
        let b = fx.tracker.open_attempt("d1", "2.0.0", "esp32", None).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn full_lifecycle_updates_device_rollout_and_stats() {
        let fx = setup().await;
        let artifact = upload(&fx.catalog, "2.0.0").await;
        let rollout = active_rollout(&fx.db, "2.0.0", RolloutType::Immediate, 100).await;
        fx.tracker
            .open_attempt("d1", "2.0.0", "esp32", Some(rollout.id))
            .await
            .unwrap();

        let a = applied(fx.tracker.progress("d1", 50, "writing").await.unwrap());
        assert_eq!(a.status, AttemptStatus::Downloading);

        let a = applied(fx.tracker.complete("d1", "2.0.0").await.unwrap());
        assert_eq!(a.status, AttemptStatus::Completed);
        assert_eq!(a.last_percent, 100);

        assert_eq!(fx.db.get_device("d1").await.unwrap().firmware_version, "2.0.0");
        let r = fx.db.get_rollout(rollout.id).await.unwrap();
        assert_eq!((r.completed_count, r.pending_count), (1, 0));
        let artifact = fx.db.get_artifact_by_id(artifact.id).await.unwrap();
        assert_eq!(artifact.success_count, 1);
    }

    #[tokio::test]
    async fn completion_without_attempt_is_ignored_but_version_updates() {
        let fx = setup().await;
        let outcome = fx.tracker.complete("d1", "3.1.0").await.unwrap();
        assert!(matches!(outcome, ReportOutcome::Ignored));
        assert_eq!(fx.db.get_device("d1").await.unwrap().firmware_version, "3.1.0");
        assert!(fx.db.latest_attempt_for("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_device_is_an_error() {
        let fx = setup().await;
        assert!(matches!(
            fx.tracker.complete("ghost", "1.0").await,
            Err(TrackerError::UnknownDevice(_))
        ));
        assert!(matches!(
            fx.tracker.failed("ghost", "boom").await,
            Err(TrackerError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn failure_is_recorded_and_attributed() {
        let fx = setup().await;
        let artifact = upload(&fx.catalog, "2.0.0").await;
        fx.tracker.open_attempt("d1", "2.0.0", "esp32", None).await.unwrap();

        let a = applied(fx.tracker.failed("d1", "checksum mismatch").await.unwrap());
        assert_eq!(a.status, AttemptStatus::Failed);
        assert_eq!(a.error_message.as_deref(), Some("checksum mismatch"));

        let artifact = fx.db.get_artifact_by_id(artifact.id).await.unwrap();
        assert_eq!(artifact.failure_count, 1);

        // Nothing open any more: ignored, and still not an error.
        assert!(matches!(
            fx.tracker.failed("d1", "again").await.unwrap(),
            ReportOutcome::Ignored
        ));
    }

    #[tokio::test]
    async fn decline_without_pending_creates_record_and_sets_preference() {
        let fx = setup().await;
        let a = applied(fx.tracker.declined("d1", "2.0.0", Some(false)).await.unwrap());
        assert_eq!(a.status, AttemptStatus::Declined);
        assert!(!fx.db.get_device("d1").await.unwrap().auto_update);
    }

    #[tokio::test]
    async fn decline_moves_rollout_counters() {
        let fx = setup().await;
        let rollout = active_rollout(&fx.db, "2.0.0", RolloutType::Immediate, 100).await;
        fx.tracker
            .open_attempt("d1", "2.0.0", "esp32", Some(rollout.id))
            .await
            .unwrap();

        applied(fx.tracker.declined("d1", "2.0.0", None).await.unwrap());
        let r = fx.db.get_rollout(rollout.id).await.unwrap();
        assert_eq!((r.declined_count, r.pending_count, r.total_targets), (1, 0, 1));
    }

    #[tokio::test]
    async fn check_for_updates_requires_active_matching_rollout() {
        let fx = setup().await;
        upload(&fx.catalog, "2.0.0").await;
        assert!(fx.tracker.check_for_updates("d1").await.unwrap().is_none());

        let rollout = active_rollout(&fx.db, "2.0.0", RolloutType::Immediate, 100).await;
        let update = fx.tracker.check_for_updates("d1").await.unwrap().unwrap();
        assert_eq!(update.artifact.version, "2.0.0");
        assert_eq!(update.rollout.id, rollout.id);

        fx.db
            .update_rollout_status(rollout.id, RolloutStatus::Paused)
            .await
            .unwrap();
        assert!(fx.tracker.check_for_updates("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn check_for_updates_respects_auto_update_and_version() {
        let fx = setup().await;
        upload(&fx.catalog, "2.0.0").await;
        active_rollout(&fx.db, "2.0.0", RolloutType::Immediate, 100).await;

        fx.db.set_device_firmware_version("d1", "2.0").await.unwrap();
        assert!(fx.tracker.check_for_updates("d1").await.unwrap().is_none());

        fx.db.set_device_firmware_version("d1", "1.0.0").await.unwrap();
        fx.db.set_device_auto_update("d1", false).await.unwrap();
        assert!(fx.tracker.check_for_updates("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_percent_gradual_offers_nothing() {
        let fx = setup().await;
        upload(&fx.catalog, "2.0.0").await;
        active_rollout(&fx.db, "2.0.0", RolloutType::Gradual, 0).await;
        assert!(fx.tracker.check_for_updates("d1").await.unwrap().is_none());
    }
}
