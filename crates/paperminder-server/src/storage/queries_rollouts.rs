//! Rollout and update-attempt queries for the `PaperMinder` server.

use paperminder_core::db::unix_timestamp;
use sqlx::types::Json;
use sqlx::{Sqlite, Transaction};

use super::db::{Database, DatabaseError};
use super::models::{AttemptStatus, Rollout, RolloutStatus, RolloutType, UpdateAttempt, UpdateChannel};

/// Parameters for creating a rollout.
pub struct NewRollout<'a> {
    pub firmware_version: &'a str,
    pub rollout_type: RolloutType,
    pub percentage: i64,
    pub scheduled_at: Option<i64>,
    pub target_all: bool,
    pub target_user_ids: &'a [String],
    pub target_device_ids: &'a [String],
    pub target_channels: &'a [UpdateChannel],
    pub min_version: Option<&'a str>,
    pub max_version: Option<&'a str>,
}

/// Terminal outcome reported for an open update attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    Failed(String),
    Declined,
}

impl AttemptOutcome {
    const fn status(&self) -> AttemptStatus {
        match self {
            Self::Completed => AttemptStatus::Completed,
            Self::Failed(_) => AttemptStatus::Failed,
            Self::Declined => AttemptStatus::Declined,
        }
    }
}

impl Database {
    // =========================================================================
    // Rollout queries
    // =========================================================================

    /// Create a rollout in `pending` status with zeroed counters.
    pub async fn create_rollout(&self, params: &NewRollout<'_>) -> Result<Rollout, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO rollouts (firmware_version, rollout_type, percentage, scheduled_at, target_all, target_user_ids, target_device_ids, target_channels, min_version, max_version, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.firmware_version)
        .bind(params.rollout_type)
        .bind(params.percentage)
        .bind(params.scheduled_at)
        .bind(params.target_all)
        .bind(Json(params.target_user_ids))
        .bind(Json(params.target_device_ids))
        .bind(Json(params.target_channels))
        .bind(params.min_version)
        .bind(params.max_version)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_rollout(result.last_insert_rowid()).await
    }

    /// Get a rollout by ID.
    pub async fn get_rollout(&self, id: i64) -> Result<Rollout, DatabaseError> {
        sqlx::query_as::<_, Rollout>("SELECT * FROM rollouts WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Rollout {id}")))
    }

    /// List rollouts, newest first, optionally filtered by status.
    pub async fn list_rollouts(
        &self,
        status: Option<RolloutStatus>,
    ) -> Result<Vec<Rollout>, DatabaseError> {
        let rollouts = sqlx::query_as::<_, Rollout>(
            "SELECT * FROM rollouts WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at DESC, id DESC",
        )
        .bind(status)
        .fetch_all(self.pool())
        .await?;

        Ok(rollouts)
    }

    /// Active rollouts for a firmware version, newest first.
    pub async fn list_active_rollouts_for_version(
        &self,
        firmware_version: &str,
    ) -> Result<Vec<Rollout>, DatabaseError> {
        let rollouts = sqlx::query_as::<_, Rollout>(
            "SELECT * FROM rollouts WHERE firmware_version = ? AND status = 'active' ORDER BY created_at DESC, id DESC",
        )
        .bind(firmware_version)
        .fetch_all(self.pool())
        .await?;

        Ok(rollouts)
    }

    /// Reset progress counters for a freshly resolved target set.
    pub async fn set_rollout_targets(&self, id: i64, total: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE rollouts SET total_targets = ?1, pending_count = ?1, completed_count = 0, failed_count = 0, declined_count = 0, updated_at = ?2 WHERE id = ?3",
        )
        .bind(total)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_rollout_status(
        &self,
        id: i64,
        status: RolloutStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE rollouts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_rollout_percentage(
        &self,
        id: i64,
        percentage: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE rollouts SET percentage = ?, updated_at = ? WHERE id = ?")
            .bind(percentage)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a rollout. Its attempts are kept with the rollout link cleared.
    pub async fn delete_rollout(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM rollouts WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Update attempt queries
    // =========================================================================

    /// Open a new `pending` attempt.
    pub async fn create_attempt(
        &self,
        device_id: &str,
        firmware_version: &str,
        platform: &str,
        rollout_id: Option<i64>,
    ) -> Result<UpdateAttempt, DatabaseError> {
        let now = unix_timestamp();

        let attempt = sqlx::query_as::<_, UpdateAttempt>(
            "INSERT INTO update_attempts (device_id, rollout_id, firmware_version, platform, status, started_at, updated_at) VALUES (?, ?, ?, ?, 'pending', ?, ?) RETURNING *",
        )
        .bind(device_id)
        .bind(rollout_id)
        .bind(firmware_version)
        .bind(platform)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(attempt)
    }

    /// Most recent `pending`/`downloading` attempt for a device, optionally
    /// restricted to one firmware version.
    pub async fn open_attempt_for(
        &self,
        device_id: &str,
        firmware_version: Option<&str>,
    ) -> Result<Option<UpdateAttempt>, DatabaseError> {
        let attempt = sqlx::query_as::<_, UpdateAttempt>(
            "SELECT * FROM update_attempts \
             WHERE device_id = ?1 AND status IN ('pending', 'downloading') \
               AND (?2 IS NULL OR firmware_version = ?2) \
             ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .bind(device_id)
        .bind(firmware_version)
        .fetch_optional(self.pool())
        .await?;

        Ok(attempt)
    }

    /// Most recent `pending` attempt for (device, version).
    pub async fn pending_attempt_for(
        &self,
        device_id: &str,
        firmware_version: &str,
    ) -> Result<Option<UpdateAttempt>, DatabaseError> {
        let attempt = sqlx::query_as::<_, UpdateAttempt>(
            "SELECT * FROM update_attempts \
             WHERE device_id = ? AND firmware_version = ? AND status = 'pending' \
             ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .bind(device_id)
        .bind(firmware_version)
        .fetch_optional(self.pool())
        .await?;

        Ok(attempt)
    }

    /// Apply a progress report to the device's latest open attempt.
    ///
    /// A percent strictly between 0 and 100 moves a `pending` attempt to
    /// `downloading`. Returns `None` when the device has no open attempt.
    pub async fn update_attempt_progress(
        &self,
        device_id: &str,
        percent: i64,
        status_message: &str,
    ) -> Result<Option<UpdateAttempt>, DatabaseError> {
        let attempt = sqlx::query_as::<_, UpdateAttempt>(
            "UPDATE update_attempts SET \
               last_percent = ?1, \
               status_message = ?2, \
               status = CASE WHEN ?1 > 0 AND ?1 < 100 THEN 'downloading' ELSE status END, \
               updated_at = ?3 \
             WHERE id = ( \
               SELECT id FROM update_attempts \
               WHERE device_id = ?4 AND status IN ('pending', 'downloading') \
               ORDER BY started_at DESC, id DESC LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(percent)
        .bind(status_message)
        .bind(unix_timestamp())
        .bind(device_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(attempt)
    }

    /// Move an open attempt to a terminal status and update its rollout's
    /// counters in the same transaction.
    pub async fn finish_attempt(
        &self,
        attempt_id: i64,
        outcome: &AttemptOutcome,
    ) -> Result<UpdateAttempt, DatabaseError> {
        let now = unix_timestamp();
        let status = outcome.status();
        let error_message = match outcome {
            AttemptOutcome::Failed(msg) => Some(msg.as_str()),
            _ => None,
        };

        let mut tx = self.pool().begin().await?;

        let attempt = sqlx::query_as::<_, UpdateAttempt>(
            "UPDATE update_attempts SET \
               status = ?1, \
               last_percent = CASE WHEN ?1 = 'completed' THEN 100 ELSE last_percent END, \
               error_message = COALESCE(?2, error_message), \
               completed_at = ?3, \
               updated_at = ?3 \
             WHERE id = ?4 AND status IN ('pending', 'downloading') \
             RETURNING *",
        )
        .bind(status)
        .bind(error_message)
        .bind(now)
        .bind(attempt_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Open update attempt {attempt_id}")))?;

        if let Some(rollout_id) = attempt.rollout_id {
            record_rollout_outcome(&mut tx, rollout_id, status, now).await?;
        }

        tx.commit().await?;
        Ok(attempt)
    }

    /// Record a decline for which no pending attempt existed.
    pub async fn insert_declined_attempt(
        &self,
        device_id: &str,
        firmware_version: &str,
        platform: &str,
    ) -> Result<UpdateAttempt, DatabaseError> {
        let now = unix_timestamp();

        let attempt = sqlx::query_as::<_, UpdateAttempt>(
            "INSERT INTO update_attempts (device_id, firmware_version, platform, status, started_at, completed_at, updated_at) VALUES (?1, ?2, ?3, 'declined', ?4, ?4, ?4) RETURNING *",
        )
        .bind(device_id)
        .bind(firmware_version)
        .bind(platform)
        .bind(now)
        .fetch_one(self.pool())
        .await?;

        Ok(attempt)
    }

    /// The device's most recent attempt in any status.
    pub async fn latest_attempt_for(
        &self,
        device_id: &str,
    ) -> Result<Option<UpdateAttempt>, DatabaseError> {
        let attempt = sqlx::query_as::<_, UpdateAttempt>(
            "SELECT * FROM update_attempts WHERE device_id = ? ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(attempt)
    }

    /// Attempt history for a device, newest first.
    pub async fn list_attempts_for_device(
        &self,
        device_id: &str,
        limit: i64,
    ) -> Result<Vec<UpdateAttempt>, DatabaseError> {
        let attempts = sqlx::query_as::<_, UpdateAttempt>(
            "SELECT * FROM update_attempts WHERE device_id = ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(attempts)
    }

    /// All attempts linked to a rollout, newest first.
    pub async fn list_attempts_for_rollout(
        &self,
        rollout_id: i64,
    ) -> Result<Vec<UpdateAttempt>, DatabaseError> {
        let attempts = sqlx::query_as::<_, UpdateAttempt>(
            "SELECT * FROM update_attempts WHERE rollout_id = ? ORDER BY started_at DESC, id DESC",
        )
        .bind(rollout_id)
        .fetch_all(self.pool())
        .await?;

        Ok(attempts)
    }
}

/// Move one unit from `pending` into the counter matching `status`.
///
/// When `pending` is already zero the attempt was opened outside the
/// creation-time target set, so `total` grows instead.
async fn record_rollout_outcome(
    tx: &mut Transaction<'_, Sqlite>,
    rollout_id: i64,
    status: AttemptStatus,
    now: i64,
) -> Result<(), DatabaseError> {
    let (completed, failed, declined) = match status {
        AttemptStatus::Completed => (1_i64, 0_i64, 0_i64),
        AttemptStatus::Failed => (0, 1, 0),
        AttemptStatus::Declined => (0, 0, 1),
        AttemptStatus::Pending | AttemptStatus::Downloading => return Ok(()),
    };

    sqlx::query(
        "UPDATE rollouts SET \
           total_targets = total_targets + CASE WHEN pending_count > 0 THEN 0 ELSE 1 END, \
           pending_count = CASE WHEN pending_count > 0 THEN pending_count - 1 ELSE 0 END, \
           completed_count = completed_count + ?, \
           failed_count = failed_count + ?, \
           declined_count = declined_count + ?, \
           updated_at = ? \
         WHERE id = ?",
    )
    .bind(completed)
    .bind(failed)
    .bind(declined)
    .bind(now)
    .bind(rollout_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}
