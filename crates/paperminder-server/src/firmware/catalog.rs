//! Firmware catalog: validated uploads, lookups, and best-effort statistics.

use std::cmp::Ordering;
use std::sync::Arc;

use md5::Md5;
use paperminder_core::platform::normalize_platform;
use paperminder_core::version::{self, Version, VersionError};
use paperminder_core::ServerConfig;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::storage::{Database, DatabaseError, FirmwareArtifact, NewArtifact, UpdateChannel};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] VersionError),

    #[error("Invalid channel: {0}")]
    InvalidChannel(String),

    #[error("Platform is required")]
    InvalidPlatform,

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Firmware version {version} already exists for platform {platform}")]
    DuplicateVersion { version: String, platform: String },

    #[error("Firmware is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// A firmware upload as received from an operator.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest<'a> {
    pub version: &'a str,
    pub platform: &'a str,
    pub channel: &'a str,
    pub data: &'a [u8],
    pub release_notes: Option<&'a str>,
    pub changelog: Option<&'a str>,
    pub mandatory: bool,
    pub min_upgrade_version: Option<&'a str>,
}

/// Hex MD5 and SHA-256 digests of a firmware image.
pub fn checksums(data: &[u8]) -> (String, String) {
    (
        hex::encode(Md5::digest(data)),
        hex::encode(Sha256::digest(data)),
    )
}

/// Numeric version ordering.
pub fn compare(a: &str, b: &str) -> Result<Ordering, VersionError> {
    version::compare(a, b)
}

#[derive(Clone)]
pub struct FirmwareCatalog {
    db: Database,
    config: Arc<ServerConfig>,
}

impl FirmwareCatalog {
    pub const fn new(db: Database, config: Arc<ServerConfig>) -> Self {
        Self { db, config }
    }

    /// Validate and store a new firmware image.
    #[instrument(skip_all, fields(version = %req.version, platform = %req.platform, size = req.data.len()))]
    pub async fn upload(&self, req: &UploadRequest<'_>) -> Result<FirmwareArtifact, CatalogError> {
        let platform = normalize_platform(req.platform);
        if platform.is_empty() {
            return Err(CatalogError::InvalidPlatform);
        }
        if !self.config.supports_platform(&platform) {
            return Err(CatalogError::UnsupportedPlatform(req.platform.to_string()));
        }
        if req.data.len() > self.config.max_firmware_size {
            return Err(CatalogError::TooLarge {
                size: req.data.len(),
                max: self.config.max_firmware_size,
            });
        }
        let version = Version::parse(req.version)?;
        let channel: UpdateChannel = req
            .channel
            .parse()
            .map_err(|_| CatalogError::InvalidChannel(req.channel.to_string()))?;
        if let Some(min) = req.min_upgrade_version {
            Version::parse(min)?;
        }

        let (md5, sha256) = checksums(req.data);
        let created = self
            .db
            .create_artifact(&NewArtifact {
                version: version.as_str(),
                platform: &platform,
                channel,
                data: req.data,
                md5: &md5,
                sha256: Some(&sha256),
                release_notes: req.release_notes,
                changelog: req.changelog,
                mandatory: req.mandatory,
                min_upgrade_version: req.min_upgrade_version,
            })
            .await
            .map_err(|e| match e {
                DatabaseError::Conflict(_) => CatalogError::DuplicateVersion {
                    version: version.to_string(),
                    platform: platform.clone(),
                },
                other => CatalogError::Storage(other),
            })?;

        info!(artifact_id = created.id, channel = %channel, md5 = %created.md5, "Firmware uploaded");
        Ok(created)
    }

    /// Look up the artifact for (version, platform).
    pub async fn get(
        &self,
        version: &str,
        platform: &str,
    ) -> Result<Option<FirmwareArtifact>, CatalogError> {
        let platform = normalize_platform(platform);
        match self.db.get_artifact(version.trim(), &platform).await {
            Ok(a) => Ok(Some(a)),
            Err(DatabaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The newest non-deprecated artifact for (channel, platform).
    ///
    /// Newest means latest release timestamp; ties are broken by version.
    pub async fn latest(
        &self,
        channel: UpdateChannel,
        platform: &str,
    ) -> Result<Option<FirmwareArtifact>, CatalogError> {
        let platform = normalize_platform(platform);
        let candidates = self.db.list_active_artifacts(channel, &platform).await?;

        Ok(candidates.into_iter().max_by(|a, b| {
            a.released_at
                .cmp(&b.released_at)
                .then_with(|| compare(&a.version, &b.version).unwrap_or(Ordering::Equal))
                .then_with(|| a.id.cmp(&b.id))
        }))
    }

    pub async fn list(
        &self,
        channel: Option<UpdateChannel>,
        platform: Option<&str>,
    ) -> Result<Vec<FirmwareArtifact>, CatalogError> {
        let platform = platform.map(normalize_platform);
        Ok(self.db.list_artifacts(channel, platform.as_deref()).await?)
    }

    /// Load an artifact and its binary for serving, counting the download.
    pub async fn download(
        &self,
        version: &str,
        platform: &str,
    ) -> Result<Option<(FirmwareArtifact, Vec<u8>)>, CatalogError> {
        let Some(artifact) = self.get(version, platform).await? else {
            return Ok(None);
        };
        let data = self.db.get_artifact_data(artifact.id).await?;
        self.record_download(artifact.id).await;
        Ok(Some((artifact, data)))
    }

    /// Exclude an artifact from `latest`. Returns `false` if it does not exist.
    pub async fn deprecate(&self, version: &str, platform: &str) -> Result<bool, CatalogError> {
        let platform = normalize_platform(platform);
        let found = self.db.deprecate_artifact(version.trim(), &platform).await?;
        if found {
            info!(version, platform = %platform, "Firmware deprecated");
        }
        Ok(found)
    }

    /// Public URL a device fetches the binary from.
    pub fn download_url(&self, artifact: &FirmwareArtifact) -> String {
        format!(
            "{}/api/firmware/download/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            artifact.platform,
            artifact.version
        )
    }

    pub async fn record_download(&self, artifact_id: i64) {
        log_counter(
            "download",
            artifact_id,
            self.db.increment_artifact_downloads(artifact_id).await,
        );
    }

    pub async fn record_success(&self, artifact_id: i64) {
        log_counter(
            "success",
            artifact_id,
            self.db.increment_artifact_successes(artifact_id).await,
        );
    }

    pub async fn record_failure(&self, artifact_id: i64) {
        log_counter(
            "failure",
            artifact_id,
            self.db.increment_artifact_failures(artifact_id).await,
        );
    }
}

fn log_counter(counter: &str, artifact_id: i64, result: Result<bool, DatabaseError>) {
    match result {
        Ok(true) => {}
        Ok(false) => warn!(counter, artifact_id, "Statistics for unknown firmware artifact skipped"),
        Err(e) => warn!(counter, artifact_id, error = %e, "Failed to record firmware statistics"),
    }
}
