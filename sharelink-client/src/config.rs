//! Client configuration
//!
//! Stored as `config.json` in the platform config directory. Every field has a
//! default so partial or older files still load.

use std::fs;
use std::io;
#[cfg(unix)]
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{
    APP_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_CHUNK_SIZE, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_PROGRESS_GRANULARITY, DEFAULT_REQUEST_CONCURRENCY, STAGING_DIR_NAME,
};

/// File permissions for the config file on Unix (owner read/write only)
#[cfg(unix)]
const CONFIG_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config directory could not be determined")]
    NoConfigDir,
    #[error("config I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunables for sessions and transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// A cached session handle unused for this long is no longer reused
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Number of request worker threads per session
    #[serde(default = "default_request_concurrency")]
    pub request_concurrency: usize,

    /// Bytes per read/write call during transfers
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Transfers report progress every this many bytes (and at completion)
    #[serde(default = "default_progress_granularity")]
    pub progress_granularity: u64,

    /// Where partial downloads are kept; `None` uses the system temp directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_request_concurrency() -> usize {
    DEFAULT_REQUEST_CONCURRENCY
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_progress_granularity() -> u64 {
    DEFAULT_PROGRESS_GRANULARITY
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            request_concurrency: DEFAULT_REQUEST_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_granularity: DEFAULT_PROGRESS_GRANULARITY,
            staging_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Staging directory for partial downloads
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(STAGING_DIR_NAME))
    }

    /// Chunk size clamped to at least one byte
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    /// Worker count clamped to at least one thread
    pub fn effective_concurrency(&self) -> usize {
        self.request_concurrency.max(1)
    }

    /// Platform-specific config file path
    ///
    /// Returns None if the config directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load from `path`, or return defaults if the file does not exist
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load from the platform config path, falling back to defaults
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Save as pretty JSON, creating the parent directory if needed
    ///
    /// On Unix the file is made readable by the owner only.
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        #[cfg(unix)]
        set_config_permissions(path)?;

        Ok(())
    }

    /// Save to the platform config path
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }
}

#[cfg(unix)]
fn set_config_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(CONFIG_FILE_MODE);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.request_concurrency, 1);
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.progress_granularity, 256 * 1024);
        assert!(config.staging_dir().ends_with(STAGING_DIR_NAME));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"chunk_size": 1024}"#).unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT_SECS);
        assert!(config.staging_dir.is_none());
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load_from(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_load_invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            ClientConfig::load_from(&path),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = ClientConfig {
            idle_timeout_secs: 5,
            request_concurrency: 4,
            staging_dir: Some(dir.path().join("staging")),
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(ClientConfig::load_from(&path).unwrap(), config);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_sets_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        ClientConfig::default().save_to(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_effective_values_never_zero() {
        let config = ClientConfig {
            chunk_size: 0,
            request_concurrency: 0,
            ..Default::default()
        };
        assert_eq!(config.effective_chunk_size(), 1);
        assert_eq!(config.effective_concurrency(), 1);
    }
}
