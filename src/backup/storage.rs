// Backup Catalog Storage - persistence for the backup record catalog

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::fs;

use super::types::{BackupError, BackupRecord};
use crate::integrity::write_bytes;

/// Where the catalog lives between process runs
///
/// `save` always receives the full catalog and replaces whatever was stored.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load(&self) -> Result<Vec<BackupRecord>, BackupError>;
    async fn save(&self, records: &[BackupRecord]) -> Result<(), BackupError>;
    fn describe(&self) -> String;
}

/// Catalog kept as one JSON document, rewritten atomically on every save
pub struct JsonCatalogStore {
    path: PathBuf,
}

impl JsonCatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CatalogStore for JsonCatalogStore {
    async fn load(&self) -> Result<Vec<BackupRecord>, BackupError> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackupError::io(
                    format!("failed to read catalog {}", self.path.display()),
                    e,
                ))
            }
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    async fn save(&self, records: &[BackupRecord]) -> Result<(), BackupError> {
        let document = serde_json::to_vec_pretty(records)?;
        write_bytes(&self.path, &document).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}

/// Catalog held in memory, mostly for tests
#[derive(Default)]
pub struct MemoryCatalogStore {
    records: Mutex<Vec<BackupRecord>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<BackupRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    /// Number of times the catalog has been saved
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every following `save` fail until switched off again
    pub fn fail_saves(&self, enabled: bool) {
        self.fail_saves.store(enabled, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<BackupRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    async fn load(&self) -> Result<Vec<BackupRecord>, BackupError> {
        Ok(self.records.lock().clone())
    }

    async fn save(&self, records: &[BackupRecord]) -> Result<(), BackupError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(BackupError::io(
                "memory catalog save",
                std::io::Error::new(std::io::ErrorKind::Other, "saves disabled"),
            ));
        }
        *self.records.lock() = records.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_catalog_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCatalogStore::new(dir.path().join("backups.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_catalog_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backups.json");
        std::fs::write(&path, b"[{").unwrap();
        let store = JsonCatalogStore::new(&path);
        assert!(matches!(store.load().await, Err(BackupError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_empty_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCatalogStore::new(dir.path().join("nested").join("backups.json"));
        store.save(&[]).await.unwrap();
        assert!(store.path().exists());
        assert!(store.load().await.unwrap().is_empty());
    }
}
