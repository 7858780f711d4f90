//! Firmware artifact queries for the `PaperMinder` server.

use paperminder_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{FirmwareArtifact, UpdateChannel};

const ARTIFACT_COLUMNS: &str = "id, version, platform, channel, size, md5, sha256, release_notes, \
     changelog, mandatory, min_upgrade_version, released_at, deprecated_at, download_count, \
     success_count, failure_count";

/// Parameters for storing a firmware artifact.
pub struct NewArtifact<'a> {
    pub version: &'a str,
    pub platform: &'a str,
    pub channel: UpdateChannel,
    pub data: &'a [u8],
    pub md5: &'a str,
    pub sha256: Option<&'a str>,
    pub release_notes: Option<&'a str>,
    pub changelog: Option<&'a str>,
    pub mandatory: bool,
    pub min_upgrade_version: Option<&'a str>,
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Downloads,
    Successes,
    Failures,
}

impl Counter {
    const fn column(self) -> &'static str {
        match self {
            Self::Downloads => "download_count",
            Self::Successes => "success_count",
            Self::Failures => "failure_count",
        }
    }
}

impl Database {
    /// Store a firmware artifact. A second artifact for the same
    /// (version, platform) is rejected with `DatabaseError::Conflict`.
    pub async fn create_artifact(
        &self,
        params: &NewArtifact<'_>,
    ) -> Result<FirmwareArtifact, DatabaseError> {
        let size = i64::try_from(params.data.len())
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let result = sqlx::query(
            "INSERT INTO firmware_artifacts (version, platform, channel, data, size, md5, sha256, release_notes, changelog, mandatory, min_upgrade_version, released_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.version)
        .bind(params.platform)
        .bind(params.channel)
        .bind(params.data)
        .bind(size)
        .bind(params.md5)
        .bind(params.sha256)
        .bind(params.release_notes)
        .bind(params.changelog)
        .bind(params.mandatory)
        .bind(params.min_upgrade_version)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_artifact_by_id(result.last_insert_rowid()).await
    }

    /// Get an artifact by (version, platform).
    pub async fn get_artifact(
        &self,
        version: &str,
        platform: &str,
    ) -> Result<FirmwareArtifact, DatabaseError> {
        sqlx::query_as::<_, FirmwareArtifact>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM firmware_artifacts WHERE version = ? AND platform = ?"
        ))
        .bind(version)
        .bind(platform)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Firmware {version} for {platform}")))
    }

    /// Get an artifact by ID.
    pub async fn get_artifact_by_id(&self, id: i64) -> Result<FirmwareArtifact, DatabaseError> {
        sqlx::query_as::<_, FirmwareArtifact>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM firmware_artifacts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Firmware artifact {id}")))
    }

    /// Load an artifact's binary payload.
    pub async fn get_artifact_data(&self, id: i64) -> Result<Vec<u8>, DatabaseError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM firmware_artifacts WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;

        row.map(|r| r.0)
            .ok_or_else(|| DatabaseError::NotFound(format!("Firmware artifact {id}")))
    }

    /// List artifacts, newest first, optionally filtered by channel and platform.
    pub async fn list_artifacts(
        &self,
        channel: Option<UpdateChannel>,
        platform: Option<&str>,
    ) -> Result<Vec<FirmwareArtifact>, DatabaseError> {
        let artifacts = sqlx::query_as::<_, FirmwareArtifact>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM firmware_artifacts \
             WHERE (?1 IS NULL OR channel = ?1) AND (?2 IS NULL OR platform = ?2) \
             ORDER BY released_at DESC, id DESC"
        ))
        .bind(channel)
        .bind(platform)
        .fetch_all(self.pool())
        .await?;

        Ok(artifacts)
    }

    /// Non-deprecated artifacts for one (channel, platform) pair.
    pub async fn list_active_artifacts(
        &self,
        channel: UpdateChannel,
        platform: &str,
    ) -> Result<Vec<FirmwareArtifact>, DatabaseError> {
        let artifacts = sqlx::query_as::<_, FirmwareArtifact>(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM firmware_artifacts \
             WHERE channel = ? AND platform = ? AND deprecated_at IS NULL \
             ORDER BY released_at DESC, id DESC"
        ))
        .bind(channel)
        .bind(platform)
        .fetch_all(self.pool())
        .await?;

        Ok(artifacts)
    }

    /// Mark an artifact deprecated. Returns `false` if it does not exist.
    pub async fn deprecate_artifact(
        &self,
        version: &str,
        platform: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE firmware_artifacts SET deprecated_at = COALESCE(deprecated_at, ?) WHERE version = ? AND platform = ?",
        )
        .bind(unix_timestamp())
        .bind(version)
        .bind(platform)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn increment_artifact_downloads(&self, id: i64) -> Result<bool, DatabaseError> {
        self.increment_artifact_counter(id, Counter::Downloads).await
    }

    pub async fn increment_artifact_successes(&self, id: i64) -> Result<bool, DatabaseError> {
        self.increment_artifact_counter(id, Counter::Successes).await
    }

    pub async fn increment_artifact_failures(&self, id: i64) -> Result<bool, DatabaseError> {
        self.increment_artifact_counter(id, Counter::Failures).await
    }

    async fn increment_artifact_counter(
        &self,
        id: i64,
        counter: Counter,
    ) -> Result<bool, DatabaseError> {
        let column = counter.column();
        let result = sqlx::query(&format!(
            "UPDATE firmware_artifacts SET {column} = {column} + 1 WHERE id = ?"
        ))
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
