//! One handle wiring the writer, backups, versioning and recovery together

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::backup::BackupManager;
use crate::config::StateKeeperConfig;
use crate::integrity::{
    AtomicWriter, ChecksumRegistry, CorruptionDetector, CorruptionReport, CorruptionScanner, WriteOptions,
    WriteReceipt,
};
use crate::recovery::RecoveryEngine;
use crate::vcs::{GitRepository, VersionControl};
use crate::versioning::StateVersionManager;
use crate::Result;

/// Durability services for the state files below one working directory
pub struct StateKeeper {
    working_dir: PathBuf,
    config: StateKeeperConfig,
    writer: AtomicWriter,
    detector: CorruptionDetector,
    backups: BackupManager,
    versions: Arc<StateVersionManager>,
    recovery: RecoveryEngine,
}

impl StateKeeper {
    /// Open with a `git` backed history in `working_dir`
    pub async fn open(working_dir: impl Into<PathBuf>, config: StateKeeperConfig) -> Result<Self> {
        let working_dir = working_dir.into();
        let vcs = Arc::new(GitRepository::from_config(&working_dir, &config.git));
        Self::with_vcs(working_dir, config, vcs).await
    }

    /// Open over any version-control backend
    ///
    /// A relative backup directory is placed under `working_dir`.
    pub async fn with_vcs(
        working_dir: impl Into<PathBuf>,
        mut config: StateKeeperConfig,
        vcs: Arc<dyn VersionControl>,
    ) -> Result<Self> {
        let working_dir = working_dir.into();
        config.validate()?;
        if config.backup.backup_dir.is_relative() {
            config.backup.backup_dir = working_dir.join(&config.backup.backup_dir);
        }

        let checksums = Arc::new(ChecksumRegistry::new());
        let detector = CorruptionDetector::new().with_checksums(Arc::clone(&checksums));

        let backups = BackupManager::open(config.backup.clone(), config.retention.clone()).await?;

        // restored files legitimately differ from the last write, so no registry here
        let versions = Arc::new(
            StateVersionManager::new(vcs, config.git.clone()).with_scanner(Arc::new(CorruptionDetector::new())),
        );
        versions.initialize().await?;

        let recovery = RecoveryEngine::new(Arc::clone(&versions)).with_backup_manager(backups.clone());
        let writer = AtomicWriter::new()
            .with_checksums(checksums)
            .with_backup_manager(backups.clone())
            .with_auto_version(versions.clone());

        info!(
            working_dir = %working_dir.display(),
            backup_dir = %config.backup.backup_dir.display(),
            versioning = config.git.enabled,
            "State keeper ready"
        );

        Ok(Self {
            working_dir,
            config,
            writer,
            detector,
            backups,
            versions,
            recovery,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Write a state document atomically, backing up the previous content and
    /// committing the new one as configured
    pub async fn write_state<T: Serialize + ?Sized>(&self, path: impl AsRef<Path>, value: &T) -> Result<WriteReceipt> {
        let mut options = WriteOptions::new().backup(self.config.backup.enabled);
        if self.config.git.enabled && self.config.git.auto_commit {
            options = options.version_commit("state", None);
        }
        self.write_state_with(path, value, &options).await
    }

    pub async fn write_state_with<T: Serialize + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
        options: &WriteOptions,
    ) -> Result<WriteReceipt> {
        let path = self.resolve(path.as_ref());
        Ok(self.writer.write_json(&path, value, options).await?)
    }

    /// Scan a state file, comparing it against the last checksum written through this keeper
    pub async fn scan(&self, path: impl AsRef<Path>) -> CorruptionReport {
        self.detector.scan_file(&self.resolve(path.as_ref())).await
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn config(&self) -> &StateKeeperConfig {
        &self.config
    }

    pub fn writer(&self) -> &AtomicWriter {
        &self.writer
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn versions(&self) -> &Arc<StateVersionManager> {
        &self.versions
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }
}
