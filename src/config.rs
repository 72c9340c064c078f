//! Configuration documents
//!
//! All sections deserialize from JSON with every field optional; durations are
//! whole seconds in the document.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backup::RetentionPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde adapter storing a [`Duration`] as whole seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Backup store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub backup_dir: PathBuf,
    /// File name of the catalog document inside `backup_dir`
    pub catalog_file: String,
    /// Verify backups after writing unless a request says otherwise
    pub verify_integrity: bool,
    /// Compress backups unless a request says otherwise
    pub compress: bool,
    pub compression_level: u32,
    /// Window in which a repeated automatic backup of the same file is skipped
    #[serde(with = "duration_secs")]
    pub skip_window: Duration,
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Number of events kept in the in-process log
    pub event_log_limit: usize,
    pub created_by: String,
    pub format_version: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_dir: PathBuf::from(".backups"),
            catalog_file: "backups.json".to_string(),
            verify_integrity: true,
            compress: false,
            compression_level: 6,
            skip_window: Duration::from_secs(5 * 60),
            worker_count: 2,
            queue_capacity: 64,
            event_log_limit: 1000,
            created_by: "statekeeper".to_string(),
            format_version: "1.0".to_string(),
        }
    }
}

impl BackupConfig {
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    pub fn with_skip_window(mut self, window: Duration) -> Self {
        self.skip_window = window;
        self
    }

    pub fn with_workers(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.worker_count = workers;
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.backup_dir.join(&self.catalog_file)
    }
}

/// Version-control settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub enabled: bool,
    pub auto_commit: bool,
    pub branch: String,
    /// Commit count above which cleanup is reported as needed
    pub max_commits: usize,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_commit: true,
            branch: "main".to_string(),
            max_commits: 100,
            user_name: None,
            user_email: None,
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateKeeperConfig {
    pub backup: BackupConfig,
    pub retention: RetentionPolicy,
    pub git: GitConfig,
}

impl StateKeeperConfig {
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let document = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json_str(&document)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention.max_count == 0 {
            return Err(ConfigError::Invalid("retention.max_count must be at least 1".into()));
        }
        if self.backup.worker_count == 0 || self.backup.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "backup.worker_count and backup.queue_capacity must be positive".into(),
            ));
        }
        if self.backup.compression_level > 9 {
            return Err(ConfigError::Invalid("backup.compression_level must be 0-9".into()));
        }
        if self.backup.catalog_file.is_empty() {
            return Err(ConfigError::Invalid("backup.catalog_file must not be empty".into()));
        }
        Ok(())
    }
}
