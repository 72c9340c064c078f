//! Crash-safe file writes
//!
//! Every write lands in a sibling temp file, is flushed to disk and then renamed over the
//! target, so readers observe either the old or the new content and never a torn file.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::checksum::{sha256_bytes, ChecksumRegistry};
use super::IntegrityError;
use crate::backup::{BackupKind, BackupManager, BackupReason, BackupRequest};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Hook invoked after a state file has been written
///
/// Returns the commit hash when a version was recorded.
#[async_trait]
pub trait AutoVersion: Send + Sync {
    async fn auto_version(
        &self,
        path: &Path,
        change_kind: &str,
        description: Option<&str>,
    ) -> anyhow::Result<Option<String>>;
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    parent_dir(path).join(format!(".tmp_{}_{}_{}", name, nanos, seq))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Write `data` to `path` through a temp file and rename
pub async fn write_bytes(path: &Path, data: &[u8]) -> Result<(), IntegrityError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)
        .await
        .map_err(|e| IntegrityError::io(dir, e))?;

    let tmp = temp_path(path);
    let outcome = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = outcome {
        let _ = fs::remove_file(&tmp).await;
        return Err(IntegrityError::io(path, e));
    }

    debug!(path = %path.display(), bytes = data.len(), "Atomic write completed");
    Ok(())
}

/// Options for [`AtomicWriter::write_json`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Back up the existing file before replacing it
    pub backup: bool,
    /// Read the file back and compare checksums
    pub verify: bool,
    /// Commit the written file through the auto-version hook
    pub version_commit: bool,
    pub commit_kind: String,
    pub commit_message: Option<String>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self {
            backup: false,
            verify: true,
            version_commit: false,
            commit_kind: "state".to_string(),
            commit_message: None,
        }
    }

    pub fn backup(mut self, enabled: bool) -> Self {
        self.backup = enabled;
        self
    }

    pub fn verify(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }

    pub fn version_commit(mut self, kind: impl Into<String>, message: Option<String>) -> Self {
        self.version_commit = true;
        self.commit_kind = kind.into();
        self.commit_message = message;
        self
    }
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a successful write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub path: PathBuf,
    pub checksum: String,
    pub bytes: u64,
    pub backup_id: Option<String>,
    pub commit: Option<String>,
    pub warnings: Vec<String>,
}

/// JSON writer with optional pre-write backup and post-write versioning
#[derive(Clone)]
pub struct AtomicWriter {
    checksums: Arc<ChecksumRegistry>,
    backups: Option<BackupManager>,
    versioner: Option<Arc<dyn AutoVersion>>,
}

impl AtomicWriter {
    pub fn new() -> Self {
        Self {
            checksums: Arc::new(ChecksumRegistry::new()),
            backups: None,
            versioner: None,
        }
    }

    pub fn with_checksums(mut self, registry: Arc<ChecksumRegistry>) -> Self {
        self.checksums = registry;
        self
    }

    pub fn with_backup_manager(mut self, manager: BackupManager) -> Self {
        self.backups = Some(manager);
        self
    }

    pub fn with_auto_version(mut self, hook: Arc<dyn AutoVersion>) -> Self {
        self.versioner = Some(hook);
        self
    }

    pub fn checksums(&self) -> Arc<ChecksumRegistry> {
        Arc::clone(&self.checksums)
    }

    /// Last checksum recorded for `path` by this writer
    pub fn checksum_of(&self, path: &Path) -> Option<String> {
        self.checksums.get(path)
    }

    /// Serialize `value` as pretty JSON and write it atomically
    ///
    /// Backup and versioning hooks never fail the write; their problems are
    /// reported as warnings on the receipt.
    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
        options: &WriteOptions,
    ) -> Result<WriteReceipt, IntegrityError> {
        let path = path.as_ref();
        let data = serde_json::to_vec_pretty(value)?;
        let checksum = sha256_bytes(&data);
        let mut warnings = Vec::new();

        let mut backup_id = None;
        if options.backup {
            if let Some(manager) = &self.backups {
                if fs::try_exists(path).await.unwrap_or(false) {
                    let request = BackupRequest::new(path)
                        .kind(BackupKind::Automatic)
                        .reason(BackupReason::PreWrite);
                    match manager.create_backup(request).await {
                        Ok(result) => backup_id = result.backup.map(|record| record.id),
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Pre-write backup failed");
                            warnings.push(format!("Pre-write backup failed: {}", e));
                        }
                    }
                }
            }
        }

        write_bytes(path, &data).await?;

        if options.verify {
            let written = fs::read(path)
                .await
                .map_err(|e| IntegrityError::io(path, e))?;
            let actual = sha256_bytes(&written);
            if actual != checksum {
                return Err(IntegrityError::VerificationFailed {
                    path: path.to_path_buf(),
                    expected: checksum,
                    actual,
                });
            }
        }

        self.checksums.record(path, checksum.clone());

        let mut commit = None;
        if options.version_commit {
            if let Some(hook) = &self.versioner {
                match hook
                    .auto_version(path, &options.commit_kind, options.commit_message.as_deref())
                    .await
                {
                    Ok(hash) => commit = hash,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Auto-version after write failed");
                        warnings.push(format!("Auto-version failed: {}", e));
                    }
                }
            }
        }

        Ok(WriteReceipt {
            path: path.to_path_buf(),
            checksum,
            bytes: data.len() as u64,
            backup_id,
            commit,
            warnings,
        })
    }

    pub async fn read_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> Result<T, IntegrityError> {
        let path = path.as_ref();
        let data = fs::read(path)
            .await
            .map_err(|e| IntegrityError::io(path, e))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

impl Default for AtomicWriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct RecordingHook {
        calls: Mutex<Vec<(PathBuf, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl AutoVersion for RecordingHook {
        async fn auto_version(
            &self,
            path: &Path,
            change_kind: &str,
            _description: Option<&str>,
        ) -> anyhow::Result<Option<String>> {
            self.calls.lock().push((path.to_path_buf(), change_kind.to_string()));
            if self.fail {
                anyhow::bail!("repository unavailable");
            }
            Ok(Some("abc123".to_string()))
        }
    }

    #[tokio::test]
    async fn test_write_bytes_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_bytes(&path, b"{\"a\":1}").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":1}");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_write_json_records_checksum_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("story-1.json");
        let hook = Arc::new(RecordingHook {
            calls: Mutex::new(Vec::new()),
            fail: false,
        });
        let writer = AtomicWriter::new().with_auto_version(hook.clone());

        let receipt = writer
            .write_json(&path, &json!({"id": 1}), &WriteOptions::new().version_commit("story", None))
            .await
            .unwrap();

        assert_eq!(writer.checksum_of(&path), Some(receipt.checksum.clone()));
        assert_eq!(receipt.commit.as_deref(), Some("abc123"));
        assert_eq!(hook.calls.lock()[0].1, "story");
    }

    #[tokio::test]
    async fn test_hook_failure_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let hook = Arc::new(RecordingHook {
            calls: Mutex::new(Vec::new()),
            fail: true,
        });
        let writer = AtomicWriter::new().with_auto_version(hook);

        let receipt = writer
            .write_json(&path, &json!({"ok": true}), &WriteOptions::new().version_commit("state", None))
            .await
            .unwrap();

        assert!(receipt.commit.is_none());
        assert_eq!(receipt.warnings.len(), 1);
        let value: serde_json::Value = writer.read_json(&path).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
    }
}
