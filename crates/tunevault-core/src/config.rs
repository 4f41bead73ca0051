//! Application configuration.
//!
//! One JSON file under the platform config directory. Missing file means
//! defaults; a malformed file is an error rather than a silent reset, so
//! a typo never wipes the user's settings.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::queue::QueueConfig;

const CONFIG_DIR_NAME: &str = "tunevault";
const CONFIG_FILE_NAME: &str = "config.json";

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Directory playlists are stored in.
    #[serde(default = "default_playlists_directory")]
    pub playlists_directory: PathBuf,
    /// Directory downloaded media is cached in.
    #[serde(default = "default_cache_directory")]
    pub cache_directory: PathBuf,
    /// Download queue tuning.
    #[serde(default)]
    pub queue: QueueConfig,
}

fn data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

fn default_playlists_directory() -> PathBuf {
    data_root().join("playlists")
}

fn default_cache_directory() -> PathBuf {
    data_root().join("cache")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            playlists_directory: default_playlists_directory(),
            cache_directory: default_cache_directory(),
            queue: QueueConfig::default(),
        }
    }
}

impl AppConfig {
    /// Clamp queue settings and check both storage directories.
    ///
    /// # Errors
    ///
    /// Returns an error if either directory is unusable.
    pub fn validate(&mut self) -> Result<()> {
        self.queue.validate();
        validate_storage_directory(&self.playlists_directory)?;
        validate_storage_directory(&self.cache_directory)?;
        Ok(())
    }
}

/// Check that a storage directory is absolute, creatable, and writable.
///
/// The writability probe actually creates and removes a file; permission
/// problems surface at startup instead of mid-download.
///
/// # Errors
///
/// Returns [`Error::Configuration`] describing the failure.
pub fn validate_storage_directory(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::Configuration(format!(
            "storage directory must be an absolute path: {}",
            path.display()
        )));
    }
    std::fs::create_dir_all(path).map_err(|e| {
        Error::Configuration(format!("cannot create {}: {e}", path.display()))
    })?;
    let probe = tempfile::NamedTempFile::new_in(path).map_err(|e| {
        Error::Configuration(format!("directory not writable {}: {e}", path.display()))
    })?;
    drop(probe);
    Ok(())
}

/// Loads and saves the config file.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for the default platform location.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform config directory is unknown.
    pub fn new() -> Result<Self> {
        let dir = dirs::config_dir().ok_or_else(|| {
            Error::Configuration("no config directory available on this platform".to_string())
        })?;
        Ok(Self::with_path(
            dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
        ))
    }

    /// Manager for an explicit config file path.
    #[must_use]
    pub const fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// The config file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, falling back to defaults when no file
    /// exists yet. Queue settings are clamped on the way in.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<AppConfig> {
        if !self.path.is_file() {
            debug!("No config file at {}; using defaults", self.path.display());
            return Ok(AppConfig::default());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| Error::fs(&self.path, &e))?;
        let mut config: AppConfig = serde_json::from_str(&raw).map_err(|e| {
            Error::Configuration(format!("malformed config {}: {e}", self.path.display()))
        })?;
        config.queue.validate();
        Ok(config)
    }

    /// Persist the configuration atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, config: &AppConfig) -> Result<()> {
        let parent = self.path.parent().ok_or_else(|| {
            Error::Configuration(format!("config path has no parent: {}", self.path.display()))
        })?;
        std::fs::create_dir_all(parent).map_err(|e| Error::fs(parent, &e))?;

        let json = serde_json::to_string_pretty(config)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::fs(parent, &e))?;
        tmp.write_all(json.as_bytes())
            .and_then(|()| tmp.write_all(b"\n"))
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| Error::fs(tmp.path(), &e))?;
        tmp.persist(&self.path)
            .map_err(|e| Error::fs(&self.path, &e.error))?;

        info!("Saved config to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("config.json"));
        let config = manager.load().unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("nested").join("config.json"));

        let mut config = AppConfig::default();
        config.queue.max_retries = 5;
        config.playlists_directory = temp.path().join("lists");
        manager.save(&config).unwrap();

        let loaded = manager.load().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_malformed_config_is_an_error_not_a_reset() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();

        let manager = ConfigManager::with_path(path.clone());
        assert!(manager.load().is_err());
        // The broken file is left for the user to inspect.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ nope");
    }

    #[test]
    fn test_load_clamps_queue_settings() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "queue": { "progress_events_per_sec": 0, "retry_jitter": 9.0 } }"#,
        )
        .unwrap();

        let config = ConfigManager::with_path(path).load().unwrap();
        assert_eq!(config.queue.progress_events_per_sec, 1);
        assert!(config.queue.retry_jitter <= 0.5);
    }

    #[test]
    fn test_validate_storage_directory_rejects_relative() {
        assert!(validate_storage_directory(Path::new("relative/dir")).is_err());
    }

    #[test]
    fn test_validate_storage_directory_creates_and_probes() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("fresh");
        validate_storage_directory(&dir).unwrap();
        assert!(dir.is_dir());
        // The probe file does not linger.
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }
}
