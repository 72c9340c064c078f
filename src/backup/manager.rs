// Backup Manager - Core backup orchestration and management
// Copy-based, checksummed file backups with retention and restore

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};

use super::queue::{Job, TaskQueue};
use super::retention::{group_by_source, select_for_removal};
use super::storage::{CatalogStore, JsonCatalogStore};
use super::types::{
    BackupError, BackupEvent, BackupFilter, BackupKind, BackupReason, BackupRecord,
    BackupRequest, BackupResult, BackupStats, BackupStatus, CleanupReport, EventKind,
    RecoveryRequest, RestoreMode, RestoreResult, RetentionPolicy, SortField, SortOrder,
    VerificationResult,
};
use crate::config::BackupConfig;
use crate::integrity::{file_checksum, sha256_bytes, write_bytes, HashingReader, HashingWriter};
use crate::metrics;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Observer for backup events; errors are logged and otherwise ignored
pub type EventHandler = Arc<dyn Fn(&BackupEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct Catalog {
    records: HashMap<String, BackupRecord>,
    stats: BackupStats,
    events: VecDeque<BackupEvent>,
}

struct Inner {
    config: BackupConfig,
    policy: RetentionPolicy,
    store: Arc<dyn CatalogStore>,
    catalog: RwLock<Catalog>,
    handlers: RwLock<Vec<EventHandler>>,
    queue: TaskQueue,
}

struct CopyOutcome {
    source_checksum: String,
    source_size: u64,
    backup_checksum: String,
    backup_size: u64,
}

/// Owner of the backup catalog; cheap to clone and safe to share
#[derive(Clone)]
pub struct BackupManager {
    inner: Arc<Inner>,
}

fn normalize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn generate_id(source: &Path) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let digest = sha256_bytes(format!("{}{}{}", source.display(), nanos, seq).as_bytes());
    format!("backup-{}", &digest[..16])
}

fn backup_file_path(dir: &Path, source: &Path, id: &str, created_at: DateTime<Utc>, compress: bool) -> PathBuf {
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let fragment = id.trim_start_matches("backup-").chars().take(8).collect::<String>();
    let mut name = format!("{}.{}.{}.backup", base, created_at.format("%Y%m%d-%H%M%S"), fragment);
    if compress {
        name.push_str(".gz");
    }
    dir.join(name)
}

// Copy and hash both sides in one pass
fn copy_with_checksums(source: &Path, dest: &Path, compress: bool, level: u32) -> io::Result<CopyOutcome> {
    let mut reader = HashingReader::new(BufReader::new(File::open(source)?));
    let mut writer = HashingWriter::new(BufWriter::new(File::create(dest)?));

    if compress {
        let mut encoder = GzEncoder::new(&mut writer, Compression::new(level));
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;
    } else {
        io::copy(&mut reader, &mut writer)?;
    }
    writer.flush()?;

    let (source_checksum, source_size, _) = reader.finish();
    let (backup_checksum, backup_size, buffered) = writer.finish();
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(CopyOutcome {
        source_checksum,
        source_size,
        backup_checksum,
        backup_size,
    })
}

fn read_backup_bytes(path: &Path, compressed: bool) -> io::Result<Vec<u8>> {
    let data = std::fs::read(path)?;
    if !compressed {
        return Ok(data);
    }
    let mut decoder = GzDecoder::new(data.as_slice());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

async fn remove_backup_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl BackupManager {
    /// Open the manager with the JSON catalog in `config.backup_dir`
    pub async fn open(config: BackupConfig, policy: RetentionPolicy) -> Result<Self, BackupError> {
        let store = Arc::new(JsonCatalogStore::new(config.catalog_path()));
        Self::with_store(config, policy, store).await
    }

    /// Open the manager over an explicit catalog store; must be called inside a runtime
    pub async fn with_store(
        config: BackupConfig,
        policy: RetentionPolicy,
        store: Arc<dyn CatalogStore>,
    ) -> Result<Self, BackupError> {
        let mut catalog = Catalog::default();
        for record in store.load().await? {
            if record.status == BackupStatus::Creating || !record.is_valid() {
                warn!(backup_id = %record.id, "Dropping incomplete catalog entry");
                continue;
            }
            catalog.records.insert(record.id.clone(), record);
        }
        info!(
            store = %store.describe(),
            backups = catalog.records.len(),
            "Backup catalog loaded"
        );

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let queue = TaskQueue::start(config.worker_count, config.queue_capacity, move |job| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        BackupManager { inner }.run_job(job).await;
                    }
                }
            });
            Inner {
                config,
                policy,
                store,
                catalog: RwLock::new(catalog),
                handlers: RwLock::new(Vec::new()),
                queue,
            }
        });

        Ok(Self { inner })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.inner.config
    }

    pub fn retention_policy(&self) -> &RetentionPolicy {
        &self.inner.policy
    }

    /// Back up one file
    ///
    /// Returns a skipped result, not an error, when backups are disabled or a recent
    /// completed backup of a skippable kind exists. On any failure the partial backup
    /// file and its catalog entry are removed before returning.
    #[instrument(skip(self, request), fields(source = %request.source_path.display(), kind = request.kind.as_str()))]
    pub async fn create_backup(&self, request: BackupRequest) -> Result<BackupResult, BackupError> {
        let started = Instant::now();
        if !self.inner.config.enabled {
            return Ok(BackupResult::skipped("backup disabled", started.elapsed()));
        }

        let source = normalize(&request.source_path);
        match fs::metadata(&source).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(BackupError::SourceNotFound(source)),
        }

        if !request.force && request.kind.is_skippable() {
            if let Some(recent) = self.recent_backup(&source) {
                self.inner.catalog.write().stats.skipped_backups += 1;
                self.emit(
                    BackupEvent::new(EventKind::BackupSkipped, format!("Recent backup {} exists", recent.id))
                        .source(&source)
                        .backup(&recent.id),
                );
                metrics::record_backup(request.kind.as_str(), "skipped", started.elapsed());
                debug!(backup_id = %recent.id, "Skipping backup, recent one exists");
                return Ok(BackupResult::skipped(
                    format!("backup {} created within the last {:?}", recent.id, self.inner.config.skip_window),
                    started.elapsed(),
                ));
            }
        }

        if request.background {
            let job = Job::Backup {
                request: request.clone(),
                source: source.clone(),
            };
            if self.inner.queue.submit(job) {
                return Ok(BackupResult {
                    success: true,
                    skipped: false,
                    skip_reason: None,
                    queued: true,
                    backup: None,
                    duration: started.elapsed(),
                    bytes: 0,
                });
            }
            warn!(source = %source.display(), "Background queue unavailable, backing up inline");
        }

        self.perform_backup(request, source, started).await
    }

    async fn perform_backup(
        &self,
        request: BackupRequest,
        source: PathBuf,
        started: Instant,
    ) -> Result<BackupResult, BackupError> {
        let config = &self.inner.config;
        let compress = request.compress.unwrap_or(config.compress);
        let verify = request.verify.unwrap_or(config.verify_integrity);
        let created_at = Utc::now();

        let (id, backup_path) = {
            let mut catalog = self.inner.catalog.write();
            let mut id = generate_id(&source);
            while catalog.records.contains_key(&id) {
                id = generate_id(&source);
            }
            let backup_path = backup_file_path(&config.backup_dir, &source, &id, created_at, compress);
            catalog.records.insert(
                id.clone(),
                BackupRecord {
                    id: id.clone(),
                    source_path: source.clone(),
                    backup_path: backup_path.clone(),
                    kind: request.kind,
                    reason: request.reason,
                    status: BackupStatus::Creating,
                    created_at,
                    completed_at: None,
                    duration_ms: 0,
                    source_size: 0,
                    backup_size: 0,
                    source_checksum: String::new(),
                    backup_checksum: String::new(),
                    compressed: compress,
                    integrity_checked: false,
                    tags: request.tags.clone(),
                    created_by: config.created_by.clone(),
                    version: config.format_version.clone(),
                },
            );
            (id, backup_path)
        };

        info!(backup_id = %id, backup_path = %backup_path.display(), "Starting backup");
        self.emit(
            BackupEvent::new(EventKind::BackupStarted, "Backup started")
                .source(&source)
                .backup(&id),
        );

        match self.materialize(&id, &source, &backup_path, compress, verify, started).await {
            Ok(record) => {
                let duration = started.elapsed();
                {
                    let mut catalog = self.inner.catalog.write();
                    let stats = &mut catalog.stats;
                    stats.total_backups += 1;
                    stats.successful_backups += 1;
                    let n = stats.successful_backups as f64;
                    stats.average_duration_ms += (duration.as_millis() as f64 - stats.average_duration_ms) / n;
                    stats.last_backup = Some(record.created_at);
                }
                info!(
                    backup_id = %id,
                    source_size = record.source_size,
                    backup_size = record.backup_size,
                    compressed = compress,
                    verified = record.integrity_checked,
                    "Backup created successfully"
                );
                self.emit(
                    BackupEvent::new(EventKind::BackupCompleted, "Backup completed")
                        .source(&source)
                        .backup(&id)
                        .duration(duration),
                );
                metrics::record_backup(request.kind.as_str(), "success", duration);
                self.inner.queue.submit(Job::RetentionSweep(source));

                Ok(BackupResult {
                    success: true,
                    skipped: false,
                    skip_reason: None,
                    queued: false,
                    bytes: record.backup_size,
                    backup: Some(record),
                    duration,
                })
            }
            Err(e) => {
                self.discard_partial(&id, &backup_path).await;
                {
                    let mut catalog = self.inner.catalog.write();
                    catalog.stats.total_backups += 1;
                    catalog.stats.failed_backups += 1;
                }
                error!(backup_id = %id, error = %e, "Backup failed");
                self.emit(
                    BackupEvent::new(EventKind::BackupFailed, "Backup failed")
                        .source(&source)
                        .backup(&id)
                        .error(&e)
                        .duration(started.elapsed()),
                );
                metrics::record_backup(request.kind.as_str(), "failure", started.elapsed());
                Err(e)
            }
        }
    }

    async fn materialize(
        &self,
        id: &str,
        source: &Path,
        backup_path: &Path,
        compress: bool,
        verify: bool,
        started: Instant,
    ) -> Result<BackupRecord, BackupError> {
        fs::create_dir_all(&self.inner.config.backup_dir)
            .await
            .map_err(|e| BackupError::io("failed to create backup directory", e))?;

        let level = self.inner.config.compression_level.min(9);
        let (src, dst) = (source.to_path_buf(), backup_path.to_path_buf());
        let copy = tokio::task::spawn_blocking(move || copy_with_checksums(&src, &dst, compress, level))
            .await?
            .map_err(|e| BackupError::io(format!("failed to copy {}", source.display()), e))?;

        if verify {
            let (actual, _) = file_checksum(backup_path).await?;
            if actual != copy.backup_checksum {
                return Err(BackupError::ChecksumMismatch {
                    path: backup_path.to_path_buf(),
                    expected: copy.backup_checksum,
                    actual,
                });
            }
        }

        let record = {
            let mut catalog = self.inner.catalog.write();
            let record = catalog
                .records
                .get_mut(id)
                .ok_or_else(|| BackupError::NotFound(id.to_string()))?;
            record.source_checksum = copy.source_checksum;
            record.source_size = copy.source_size;
            record.backup_checksum = copy.backup_checksum;
            record.backup_size = copy.backup_size;
            record.completed_at = Some(Utc::now());
            record.duration_ms = started.elapsed().as_millis() as u64;
            record.advance(BackupStatus::Completed)?;
            if verify {
                record.advance(BackupStatus::Verified)?;
                record.integrity_checked = true;
            }
            record.clone()
        };

        self.persist().await?;
        Ok(record)
    }

    async fn discard_partial(&self, id: &str, backup_path: &Path) {
        if let Err(e) = remove_backup_file(backup_path).await {
            warn!(backup_id = %id, error = %e, "Failed to remove partial backup file");
        }
        self.inner.catalog.write().records.remove(id);
    }

    fn recent_backup(&self, source: &Path) -> Option<BackupRecord> {
        let window = chrono::Duration::from_std(self.inner.config.skip_window).ok()?;
        let cutoff = Utc::now() - window;
        self.inner
            .catalog
            .read()
            .records
            .values()
            .filter(|r| r.source_path == source && r.status.is_usable() && r.created_at > cutoff)
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    /// Restore a file from a cataloged backup
    ///
    /// `preview` reports the planned changes without touching the file system and
    /// `merge` is rejected before any side effect.
    #[instrument(skip(self, request), fields(mode = %request.mode))]
    pub async fn recover_from_backup(&self, request: RecoveryRequest) -> Result<RestoreResult, BackupError> {
        let started = Instant::now();
        if request.mode == RestoreMode::Merge {
            return Err(BackupError::UnsupportedRestoreMode(RestoreMode::Merge));
        }

        let record = self.select_backup(&request)?;
        let target = normalize(
            request
                .restore_path
                .as_deref()
                .or(request.source_path.as_deref())
                .unwrap_or(&record.source_path),
        );

        if request.mode == RestoreMode::Preview {
            return self.preview_restore(&request, record, target, started).await;
        }

        self.emit(
            BackupEvent::new(EventKind::RecoveryStarted, format!("Restoring {}", target.display()))
                .source(&record.source_path)
                .backup(&record.id),
        );

        let mut changes = Vec::new();
        let mut warnings = Vec::new();
        match self
            .apply_restore(&request, &record, &target, &mut changes, &mut warnings)
            .await
        {
            Ok((bytes_restored, emergency_backup_id, renamed_to)) => {
                let duration = started.elapsed();
                self.inner.catalog.write().stats.total_recoveries += 1;
                info!(
                    backup_id = %record.id,
                    target = %target.display(),
                    bytes = bytes_restored,
                    warnings = warnings.len(),
                    "Restore completed"
                );
                self.emit(
                    BackupEvent::new(EventKind::RecoveryCompleted, format!("Restored {}", target.display()))
                        .source(&record.source_path)
                        .backup(&record.id)
                        .duration(duration),
                );
                metrics::record_restore(request.mode.as_str(), "success");
                Ok(RestoreResult {
                    success: true,
                    preview: false,
                    restored_path: target,
                    bytes_restored,
                    backup: record,
                    emergency_backup_id,
                    renamed_to,
                    changes,
                    warnings,
                    duration,
                })
            }
            Err(e) => {
                error!(backup_id = %record.id, error = %e, "Restore failed");
                self.emit(
                    BackupEvent::new(EventKind::RecoveryFailed, format!("Restore of {} failed", target.display()))
                        .source(&record.source_path)
                        .backup(&record.id)
                        .error(&e)
                        .duration(started.elapsed()),
                );
                metrics::record_restore(request.mode.as_str(), "failure");
                Err(e)
            }
        }
    }

    async fn apply_restore(
        &self,
        request: &RecoveryRequest,
        record: &BackupRecord,
        target: &Path,
        changes: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<(u64, Option<String>, Option<PathBuf>), BackupError> {
        if request.verify_before {
            let verification = self.verify_backup(&record.id).await?;
            if !verification.valid {
                return Err(BackupError::ChecksumMismatch {
                    path: record.backup_path.clone(),
                    expected: verification.expected,
                    actual: verification.actual,
                });
            }
        }

        // read before the emergency backup can trigger a sweep of this record
        let (path, compressed) = (record.backup_path.clone(), record.compressed);
        let data = tokio::task::spawn_blocking(move || read_backup_bytes(&path, compressed))
            .await?
            .map_err(|e| BackupError::io(format!("failed to read backup {}", record.id), e))?;

        let target_exists = fs::try_exists(target).await.unwrap_or(false);

        let mut emergency_backup_id = None;
        if request.create_backup && target_exists {
            let emergency = BackupRequest::new(target)
                .kind(BackupKind::Emergency)
                .reason(BackupReason::PreRecovery)
                .tag("pre-recovery")
                .compress(false)
                .verify(true)
                .force(true);
            match self.create_backup(emergency).await {
                Ok(result) => {
                    if let Some(backup) = result.backup {
                        changes.push(format!("Created pre-recovery backup {}", backup.id));
                        emergency_backup_id = Some(backup.id);
                    }
                }
                Err(e) => {
                    warn!(target = %target.display(), error = %e, "Pre-recovery backup failed");
                    warnings.push(format!("Failed to create pre-recovery backup: {}", e));
                }
            }
        }

        let mut renamed_to = None;
        if request.mode == RestoreMode::Rename && target_exists {
            let aside = PathBuf::from(format!("{}.backup.{}", target.display(), Utc::now().timestamp()));
            fs::rename(target, &aside)
                .await
                .map_err(|e| BackupError::io(format!("failed to rename {}", target.display()), e))?;
            changes.push(format!("Renamed existing file to {}", aside.display()));
            renamed_to = Some(aside);
        }

        write_bytes(target, &data).await?;
        changes.push(format!(
            "Restored {} bytes from backup {} to {}",
            data.len(),
            record.id,
            target.display()
        ));

        if request.verify_after {
            // hash the restored file as it now is on disk
            let restored = match file_checksum(target).await {
                Ok((checksum, _)) => checksum,
                Err(e) => {
                    warn!(target = %target.display(), error = %e, "Restored file unreadable");
                    format!("unreadable ({})", e)
                }
            };
            if restored != record.source_checksum {
                warn!(backup_id = %record.id, "Restored content does not match recorded source checksum");
                warnings.push(format!(
                    "Restored checksum {} differs from recorded source checksum {}",
                    restored, record.source_checksum
                ));
            } else {
                self.emit(
                    BackupEvent::new(EventKind::IntegrityCheck, "Restored file matches source checksum")
                        .source(target)
                        .backup(&record.id),
                );
            }
        }

        Ok((data.len() as u64, emergency_backup_id, renamed_to))
    }

    async fn preview_restore(
        &self,
        request: &RecoveryRequest,
        record: BackupRecord,
        target: PathBuf,
        started: Instant,
    ) -> Result<RestoreResult, BackupError> {
        let mut changes = Vec::new();
        let mut warnings = Vec::new();

        if request.verify_before {
            match file_checksum(&record.backup_path).await {
                Ok((actual, _)) if actual == record.backup_checksum => {}
                Ok((actual, _)) => warnings.push(format!(
                    "Backup checksum mismatch: expected {}, found {}",
                    record.backup_checksum, actual
                )),
                Err(e) => warnings.push(format!("Backup file unreadable: {}", e)),
            }
        }

        let target_exists = fs::try_exists(&target).await.unwrap_or(false);
        if request.create_backup && target_exists {
            changes.push(format!("Would create pre-recovery backup of {}", target.display()));
        }
        if request.mode == RestoreMode::Rename && target_exists {
            changes.push(format!(
                "Would rename existing file to {}.backup.<timestamp>",
                target.display()
            ));
        }
        changes.push(format!(
            "Would restore {} bytes from backup {} to {}",
            record.source_size,
            record.id,
            target.display()
        ));

        Ok(RestoreResult {
            success: true,
            preview: true,
            restored_path: target,
            bytes_restored: record.source_size,
            backup: record,
            emergency_backup_id: None,
            renamed_to: None,
            changes,
            warnings,
            duration: started.elapsed(),
        })
    }

    fn select_backup(&self, request: &RecoveryRequest) -> Result<BackupRecord, BackupError> {
        let catalog = self.inner.catalog.read();
        if let Some(id) = &request.backup_id {
            let record = catalog
                .records
                .get(id)
                .ok_or_else(|| BackupError::NotFound(id.clone()))?;
            if !record.is_valid() || !record.status.is_usable() {
                return Err(BackupError::NotRestorable {
                    id: id.clone(),
                    status: record.status,
                });
            }
            return Ok(record.clone());
        }

        let source = request
            .source_path
            .as_deref()
            .map(normalize)
            .ok_or_else(|| BackupError::NoBackupAvailable(PathBuf::new()))?;
        let candidates = catalog
            .records
            .values()
            .filter(|r| r.source_path == source && r.status.is_usable())
            .filter(|r| request.before.map_or(true, |t| r.created_at <= t));

        candidates
            .max_by_key(|r| r.created_at)
            .cloned()
            .ok_or(BackupError::NoBackupAvailable(source))
    }

    /// Recheck a backup file against its recorded checksum
    ///
    /// A match promotes the record to `verified`; a mismatch or unreadable file
    /// marks it `corrupted`.
    pub async fn verify_backup(&self, id: &str) -> Result<VerificationResult, BackupError> {
        let record = self
            .get_backup(id)
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;

        let actual = match file_checksum(&record.backup_path).await {
            Ok((actual, _)) => actual,
            Err(e) => {
                warn!(backup_id = %id, error = %e, "Backup file unreadable");
                String::new()
            }
        };
        let valid = actual == record.backup_checksum;

        let changed = {
            let mut catalog = self.inner.catalog.write();
            match catalog.records.get_mut(id) {
                Some(entry) if valid && entry.status == BackupStatus::Completed => {
                    entry.integrity_checked = true;
                    entry.advance(BackupStatus::Verified).is_ok()
                }
                Some(entry) if !valid => entry.advance(BackupStatus::Corrupted).is_ok(),
                _ => false,
            }
        };
        if changed {
            self.persist().await?;
        }

        if valid {
            self.emit(
                BackupEvent::new(EventKind::IntegrityCheck, "Backup checksum verified")
                    .source(&record.source_path)
                    .backup(id),
            );
        } else {
            error!(backup_id = %id, expected = %record.backup_checksum, actual = %actual, "Backup corrupted");
            self.emit(
                BackupEvent::new(EventKind::CorruptionDetected, "Backup checksum mismatch")
                    .source(&record.source_path)
                    .backup(id)
                    .error(format!("expected {}, found {}", record.backup_checksum, actual)),
            );
        }

        Ok(VerificationResult {
            backup_id: id.to_string(),
            valid,
            expected: record.backup_checksum,
            actual,
        })
    }

    /// Query the catalog; newest first unless the filter says otherwise
    pub fn list_backups(&self, filter: &BackupFilter) -> Vec<BackupRecord> {
        let mut filter = filter.clone();
        filter.source_path = filter.source_path.as_deref().map(normalize);

        let mut records: Vec<BackupRecord> = self
            .inner
            .catalog
            .read()
            .records
            .values()
            .filter(|r| r.status != BackupStatus::Creating && filter.matches(r))
            .cloned()
            .collect();

        records.sort_by(|a, b| {
            let ordering = match filter.sort_by {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::Size => a.backup_size.cmp(&b.backup_size),
                SortField::Kind => a.kind.as_str().cmp(b.kind.as_str()),
                SortField::Status => a.status.as_str().cmp(b.status.as_str()),
            };
            match filter.order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });

        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        records
    }

    pub fn get_backup(&self, id: &str) -> Option<BackupRecord> {
        self.inner.catalog.read().records.get(id).cloned()
    }

    /// Newest usable backup of `source`
    pub fn latest_backup(&self, source: impl AsRef<Path>) -> Option<BackupRecord> {
        let source = normalize(source.as_ref());
        self.inner
            .catalog
            .read()
            .records
            .values()
            .filter(|r| r.source_path == source && r.status.is_usable())
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    pub async fn delete_backup(&self, id: &str) -> Result<(), BackupError> {
        let record = self
            .inner
            .catalog
            .write()
            .records
            .remove(id)
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;

        if let Err(e) = remove_backup_file(&record.backup_path).await {
            self.inner.catalog.write().records.insert(record.id.clone(), record);
            return Err(BackupError::io(format!("failed to delete backup {}", id), e));
        }

        info!(backup_id = %id, "Backup deleted");
        self.persist().await
    }

    pub fn stats(&self) -> BackupStats {
        let catalog = self.inner.catalog.read();
        let mut stats = catalog.stats.clone();
        stats.total_size = catalog.records.values().map(|r| r.backup_size).sum();
        stats.oldest_backup = catalog.records.values().map(|r| r.created_at).min();
        stats
    }

    /// Register an observer; it runs on the background queue, never inline
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&BackupEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    /// In-process event log, oldest first
    pub fn events(&self) -> Vec<BackupEvent> {
        self.inner.catalog.read().events.iter().cloned().collect()
    }

    /// Apply the retention policy to every source file
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<CleanupReport, BackupError> {
        self.sweep(None).await
    }

    /// Wait for queued sweeps and notifications to finish
    pub async fn idle(&self) {
        self.inner.queue.idle().await;
    }

    /// Let queued work finish, then stop the workers
    pub async fn close(&self) {
        self.inner.queue.close().await;
    }

    /// Stop the workers now, discarding queued sweeps and notifications
    pub fn shutdown(&self) {
        self.inner.queue.shutdown();
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.queue.pending()
    }

    async fn sweep(&self, source: Option<&Path>) -> Result<CleanupReport, BackupError> {
        let now = Utc::now();
        let announce = source.is_none();
        if announce {
            self.emit(BackupEvent::new(EventKind::CleanupStarted, "Retention sweep started"));
        }

        let candidates: Vec<(String, PathBuf, u64)> = {
            let catalog = self.inner.catalog.read();
            let groups = group_by_source(
                catalog
                    .records
                    .values()
                    .filter(|r| r.status != BackupStatus::Creating),
            );
            groups
                .iter()
                .filter(|(path, _)| source.map_or(true, |s| s == path.as_path()))
                .flat_map(|(_, group)| select_for_removal(group, &self.inner.policy, now))
                .filter_map(|id| {
                    catalog
                        .records
                        .get(&id)
                        .map(|r| (id, r.backup_path.clone(), r.backup_size))
                })
                .collect()
        };

        let mut report = CleanupReport::default();
        let mut failures = Vec::new();
        for (id, path, size) in candidates {
            match remove_backup_file(&path).await {
                Ok(()) => {
                    self.inner.catalog.write().records.remove(&id);
                    debug!(backup_id = %id, "Backup removed by retention");
                    report.removed.push(id);
                    report.freed_bytes += size;
                }
                Err(e) => failures.push(format!("{}: {}", id, e)),
            }
        }

        if !report.removed.is_empty() {
            if let Err(e) = self.persist().await {
                failures.push(format!("catalog: {}", e));
            }
            metrics::record_retention_removed(report.removed.len());
        }

        {
            let mut catalog = self.inner.catalog.write();
            report.retained = catalog
                .records
                .values()
                .filter(|r| source.map_or(true, |s| r.source_path == s))
                .count();
            if announce {
                catalog.stats.last_cleanup = Some(now);
            }
        }

        if announce || !report.removed.is_empty() {
            info!(
                removed = report.removed.len(),
                retained = report.retained,
                failures = failures.len(),
                "Retention sweep finished"
            );
        }
        if announce {
            self.emit(BackupEvent::new(
                EventKind::CleanupCompleted,
                format!("Removed {} backups", report.removed.len()),
            ));
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(BackupError::Cleanup {
                removed: report.removed.len(),
                failures,
            })
        }
    }

    async fn persist(&self) -> Result<(), BackupError> {
        let records: Vec<BackupRecord> = {
            let catalog = self.inner.catalog.read();
            let mut records: Vec<BackupRecord> = catalog
                .records
                .values()
                .filter(|r| r.status != BackupStatus::Creating)
                .cloned()
                .collect();
            records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
            records
        };
        self.inner.store.save(&records).await
    }

    fn emit(&self, event: BackupEvent) {
        {
            let mut catalog = self.inner.catalog.write();
            catalog.events.push_back(event.clone());
            while catalog.events.len() > self.inner.config.event_log_limit.max(1) {
                catalog.events.pop_front();
            }
        }
        if !self.inner.handlers.read().is_empty() {
            self.inner.queue.submit(Job::Notify(event));
        }
    }

    async fn run_job(&self, job: Job) {
        match job {
            Job::Backup { request, source } => {
                if let Err(e) = self.perform_backup(request, source.clone(), Instant::now()).await {
                    warn!(source = %source.display(), error = %e, "Background backup failed");
                }
            }
            Job::RetentionSweep(source) => {
                if let Err(e) = self.sweep(Some(&source)).await {
                    warn!(source = %source.display(), error = %e, "Background retention sweep failed");
                }
            }
            Job::Notify(event) => {
                let handlers: Vec<EventHandler> = self.inner.handlers.read().clone();
                for handler in handlers {
                    if let Err(e) = handler(&event) {
                        warn!(event = ?event.kind, error = %e, "Event handler failed");
                    }
                }
            }
        }
    }
}
