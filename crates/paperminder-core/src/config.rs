//! Configuration resolution for the `PaperMinder` server.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Settings file (`--config`, or ~/.config/paperminder/server.json)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Platforms accepted for firmware uploads unless overridden.
pub const DEFAULT_PLATFORMS: &[&str] = &[
    "esp8266", "esp32", "esp32-c3", "esp32-s2", "esp32-s3", "esp32-c6",
];

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Public base URL used when building firmware download links.
    pub base_url: String,
    /// Maximum accepted firmware binary size in bytes.
    pub max_firmware_size: usize,
    /// Delivered offline-cache entries older than this are purged.
    pub cache_retention_days: u32,
    /// Interval between offline-cache purges (seconds).
    pub cache_cleanup_interval_secs: u64,
    /// Upper bound on a single outbound frame enqueue (seconds).
    pub write_timeout_secs: u64,
    pub supported_platforms: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            max_firmware_size: 5 * 1024 * 1024, // 5 MiB
            cache_retention_days: 7,
            cache_cleanup_interval_secs: 3600,
            write_timeout_secs: 10,
            supported_platforms: DEFAULT_PLATFORMS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl ServerConfig {
    /// Whether `platform` (already normalised) may receive firmware uploads.
    pub fn supports_platform(&self, platform: &str) -> bool {
        self.supported_platforms.iter().any(|p| p == platform)
    }
}

/// Load configuration: defaults, then the settings file, then env overrides.
///
/// An explicit `path` must exist; the global settings file is optional.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => ServerConfig::default(),
        },
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Path of the global settings file.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("paperminder").join("server.json"))
}

/// Default location of the server database.
pub fn database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".paperminder").join("server.db"))
}

fn load_config_file(path: &Path) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut ServerConfig) {
    if let Ok(val) = std::env::var("PAPERMINDER_MAX_FIRMWARE_SIZE") {
        if let Ok(n) = val.parse() {
            config.max_firmware_size = n;
        }
    }
    if let Ok(val) = std::env::var("PAPERMINDER_CACHE_RETENTION_DAYS") {
        if let Ok(n) = val.parse() {
            config.cache_retention_days = n;
        }
    }
    if let Ok(val) = std::env::var("PAPERMINDER_SUPPORTED_PLATFORMS") {
        config.supported_platforms = val
            .split(',')
            .map(crate::platform::normalize_platform)
            .filter(|p| !p.is_empty())
            .collect();
    }
}
