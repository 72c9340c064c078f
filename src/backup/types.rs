// Backup System Types - Core data structures and enums

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::config::duration_secs;
use crate::integrity::IntegrityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Automatic,
    Manual,
    Emergency,
    Snapshot,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::Emergency => "emergency",
            Self::Snapshot => "snapshot",
        }
    }

    /// Manual and emergency backups are never skipped by the recent-backup window
    pub fn is_skippable(&self) -> bool {
        !matches!(self, Self::Manual | Self::Emergency)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    PreWrite,
    UserRequest,
    Corruption,
    Migration,
    Scheduled,
    PreRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Creating,
    Completed,
    Verified,
    Failed,
    Corrupted,
}

impl BackupStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Creating => 0,
            Self::Completed => 1,
            Self::Verified => 2,
            Self::Failed | Self::Corrupted => 3,
        }
    }

    /// Whether the backup can be restored from
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Completed | Self::Verified)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Completed => "completed",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Corrupted => "corrupted",
        }
    }
}

/// One cataloged backup of a single file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    pub kind: BackupKind,
    pub reason: BackupReason,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub source_size: u64,
    pub backup_size: u64,
    /// SHA-256 of the source bytes at backup time
    pub source_checksum: String,
    /// SHA-256 of the bytes stored in `backup_path`
    pub backup_checksum: String,
    pub compressed: bool,
    pub integrity_checked: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_by: String,
    pub version: String,
}

impl BackupRecord {
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty()
            && !self.source_path.as_os_str().is_empty()
            && !self.backup_path.as_os_str().is_empty()
            && !self.backup_checksum.is_empty()
            && self.created_at.timestamp() > 0
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Move the status forward; earlier states are never re-entered
    pub fn advance(&mut self, next: BackupStatus) -> Result<(), BackupError> {
        if next.rank() <= self.status.rank() {
            return Err(BackupError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|tag| self.tags.contains(tag))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionStrategy {
    Simple,
    Generational,
    SizeBased,
    Smart,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub strategy: RetentionStrategy,
    pub max_count: usize,
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
    pub max_total_size: u64,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_important: bool,
}

impl RetentionPolicy {
    pub fn new() -> Self {
        Self {
            strategy: RetentionStrategy::Simple,
            max_count: 10,
            max_age: Duration::from_secs(30 * 24 * 3600), // 30 days
            max_total_size: 100 * 1024 * 1024,
            keep_daily: Some(7),
            keep_weekly: Some(4),
            keep_monthly: Some(3),
            keep_important: true,
        }
    }

    pub fn strategy(mut self, strategy: RetentionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_count(mut self, count: usize) -> Self {
        self.max_count = count;
        self
    }

    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = age;
        self
    }

    pub fn max_total_size(mut self, bytes: u64) -> Self {
        self.max_total_size = bytes;
        self
    }

    pub fn generations(mut self, daily: u32, weekly: u32, monthly: u32) -> Self {
        self.keep_daily = Some(daily);
        self.keep_weekly = Some(weekly);
        self.keep_monthly = Some(monthly);
        self
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Input to `BackupManager::create_backup`
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub source_path: PathBuf,
    pub kind: BackupKind,
    pub reason: BackupReason,
    pub tags: Vec<String>,
    /// Overrides the configured default when set
    pub compress: Option<bool>,
    /// Overrides the configured default when set
    pub verify: Option<bool>,
    /// Run on a background task and return immediately
    pub background: bool,
    /// Ignore the recent-backup skip window
    pub force: bool,
}

impl BackupRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source.into(),
            kind: BackupKind::Manual,
            reason: BackupReason::UserRequest,
            tags: Vec::new(),
            compress: None,
            verify: None,
            background: false,
            force: false,
        }
    }

    pub fn kind(mut self, kind: BackupKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn reason(mut self, reason: BackupReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn compress(mut self, enabled: bool) -> Self {
        self.compress = Some(enabled);
        self
    }

    pub fn verify(mut self, enabled: bool) -> Self {
        self.verify = Some(enabled);
        self
    }

    pub fn background(mut self, enabled: bool) -> Self {
        self.background = enabled;
        self
    }

    pub fn force(mut self, enabled: bool) -> Self {
        self.force = enabled;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BackupResult {
    pub success: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    /// Handed to a background task; the record is not available yet
    pub queued: bool,
    pub backup: Option<BackupRecord>,
    pub duration: Duration,
    pub bytes: u64,
}

impl BackupResult {
    pub(crate) fn skipped(reason: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            skipped: true,
            skip_reason: Some(reason.into()),
            queued: false,
            backup: None,
            duration,
            bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Overwrite the target in place
    Replace,
    /// Move the existing target aside with a timestamp suffix, then restore
    Rename,
    /// Not supported; rejected before any side effect
    Merge,
    /// Report what would happen without touching anything
    Preview,
}

impl RestoreMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Rename => "rename",
            Self::Merge => "merge",
            Self::Preview => "preview",
        }
    }
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "replace" => Ok(Self::Replace),
            "rename" => Ok(Self::Rename),
            "merge" => Ok(Self::Merge),
            "preview" => Ok(Self::Preview),
            other => Err(BackupError::UnknownRestoreMode(other.to_string())),
        }
    }
}

/// Input to `BackupManager::recover_from_backup`
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub source_path: Option<PathBuf>,
    pub backup_id: Option<String>,
    /// Pick the newest usable backup created at or before this instant
    pub before: Option<DateTime<Utc>>,
    pub verify_before: bool,
    pub verify_after: bool,
    /// Take an emergency backup of the current file first
    pub create_backup: bool,
    pub restore_path: Option<PathBuf>,
    pub mode: RestoreMode,
}

impl RecoveryRequest {
    pub fn for_source(source: impl Into<PathBuf>) -> Self {
        Self {
            source_path: Some(source.into()),
            backup_id: None,
            before: None,
            verify_before: true,
            verify_after: true,
            create_backup: true,
            restore_path: None,
            mode: RestoreMode::Replace,
        }
    }

    pub fn for_backup(id: impl Into<String>) -> Self {
        Self {
            source_path: None,
            backup_id: Some(id.into()),
            ..Self::for_source(PathBuf::new())
        }
    }

    pub fn before(mut self, instant: DateTime<Utc>) -> Self {
        self.before = Some(instant);
        self
    }

    pub fn mode(mut self, mode: RestoreMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn restore_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.restore_path = Some(path.into());
        self
    }

    pub fn verify(mut self, before: bool, after: bool) -> Self {
        self.verify_before = before;
        self.verify_after = after;
        self
    }

    pub fn create_backup(mut self, enabled: bool) -> Self {
        self.create_backup = enabled;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub success: bool,
    pub preview: bool,
    pub restored_path: PathBuf,
    pub bytes_restored: u64,
    pub backup: BackupRecord,
    pub emergency_backup_id: Option<String>,
    pub renamed_to: Option<PathBuf>,
    pub changes: Vec<String>,
    pub warnings: Vec<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortField {
    CreatedAt,
    Size,
    Kind,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Catalog query; every populated criterion must match
#[derive(Debug, Clone)]
pub struct BackupFilter {
    pub source_path: Option<PathBuf>,
    pub kind: Option<BackupKind>,
    pub reason: Option<BackupReason>,
    pub status: Option<BackupStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub tags: Vec<String>,
    pub verified: Option<bool>,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl BackupFilter {
    pub fn new() -> Self {
        Self {
            source_path: None,
            kind: None,
            reason: None,
            status: None,
            created_after: None,
            created_before: None,
            min_size: None,
            max_size: None,
            tags: Vec::new(),
            verified: None,
            sort_by: SortField::CreatedAt,
            order: SortOrder::Descending,
            limit: None,
        }
    }

    pub fn source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn kind(mut self, kind: BackupKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn status(mut self, status: BackupStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn verified(mut self, verified: bool) -> Self {
        self.verified = Some(verified);
        self
    }

    pub fn created_between(mut self, after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self.created_before = Some(before);
        self
    }

    pub fn size_between(mut self, min: u64, max: u64) -> Self {
        self.min_size = Some(min);
        self.max_size = Some(max);
        self
    }

    pub fn sort(mut self, field: SortField, order: SortOrder) -> Self {
        self.sort_by = field;
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.source_path.as_ref().map_or(true, |p| &record.source_path == p)
            && self.kind.map_or(true, |k| record.kind == k)
            && self.reason.map_or(true, |r| record.reason == r)
            && self.status.map_or(true, |s| record.status == s)
            && self.created_after.map_or(true, |t| record.created_at >= t)
            && self.created_before.map_or(true, |t| record.created_at <= t)
            && self.min_size.map_or(true, |s| record.backup_size >= s)
            && self.max_size.map_or(true, |s| record.backup_size <= s)
            && record.has_tags(&self.tags)
            && self.verified.map_or(true, |v| record.integrity_checked == v)
    }
}

impl Default for BackupFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BackupStarted,
    BackupCompleted,
    BackupFailed,
    BackupSkipped,
    RecoveryStarted,
    RecoveryCompleted,
    RecoveryFailed,
    CleanupStarted,
    CleanupCompleted,
    IntegrityCheck,
    CorruptionDetected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub source_path: Option<PathBuf>,
    pub backup_id: Option<String>,
    pub message: String,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl BackupEvent {
    pub(crate) fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source_path: None,
            backup_id: None,
            message: message.into(),
            error: None,
            duration_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub(crate) fn backup(mut self, id: impl Into<String>) -> Self {
        self.backup_id = Some(id.into());
        self
    }

    pub(crate) fn error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub(crate) fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStats {
    pub total_backups: u64,
    pub successful_backups: u64,
    pub failed_backups: u64,
    pub skipped_backups: u64,
    pub total_recoveries: u64,
    /// Bytes held by cataloged backups
    pub total_size: u64,
    /// Rolling mean over successful backups
    pub average_duration_ms: f64,
    pub last_backup: Option<DateTime<Utc>>,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub oldest_backup: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub retained: usize,
    pub freed_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub backup_id: String,
    pub valid: bool,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Source file not found: {0}")]
    SourceNotFound(PathBuf),
    #[error("Backup {0} not found")]
    NotFound(String),
    #[error("No usable backup available for {0}")]
    NoBackupAvailable(PathBuf),
    #[error("Backup {id} is {status:?} and cannot be restored from")]
    NotRestorable { id: String, status: BackupStatus },
    #[error("IO error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("Checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Restore mode {0} is not supported")]
    UnsupportedRestoreMode(RestoreMode),
    #[error("Unknown restore mode: {0}")]
    UnknownRestoreMode(String),
    #[error("Backup {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: BackupStatus,
        to: BackupStatus,
    },
    #[error("Cleanup removed {removed} backups but {} deletions failed: {}", .failures.len(), .failures.join("; "))]
    Cleanup { removed: usize, failures: Vec<String> },
    #[error("Background task failed: {0}")]
    Task(String),
}

impl BackupError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: BackupStatus) -> BackupRecord {
        BackupRecord {
            id: "backup-0011223344556677".into(),
            source_path: PathBuf::from("/p/state.json"),
            backup_path: PathBuf::from("/p/.backups/state.json.backup"),
            kind: BackupKind::Manual,
            reason: BackupReason::UserRequest,
            status,
            created_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            source_size: 10,
            backup_size: 10,
            source_checksum: "a".into(),
            backup_checksum: "a".into(),
            compressed: false,
            integrity_checked: false,
            tags: vec!["nightly".into()],
            created_by: "test".into(),
            version: "1.0".into(),
        }
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut rec = record(BackupStatus::Creating);
        rec.advance(BackupStatus::Completed).unwrap();
        rec.advance(BackupStatus::Verified).unwrap();
        assert!(rec.advance(BackupStatus::Creating).is_err());
        assert!(rec.advance(BackupStatus::Completed).is_err());
        rec.advance(BackupStatus::Corrupted).unwrap();
        assert!(rec.advance(BackupStatus::Failed).is_err());
    }

    #[test]
    fn test_validity_requires_checksum() {
        let mut rec = record(BackupStatus::Completed);
        assert!(rec.is_valid());
        rec.backup_checksum.clear();
        assert!(!rec.is_valid());
    }

    #[test]
    fn test_filter_requires_all_tags() {
        let rec = record(BackupStatus::Completed);
        assert!(BackupFilter::new().tag("nightly").matches(&rec));
        assert!(!BackupFilter::new().tag("nightly").tag("weekly").matches(&rec));
        assert!(!BackupFilter::new().verified(true).matches(&rec));
    }

    #[test]
    fn test_restore_mode_parsing() {
        assert_eq!("rename".parse::<RestoreMode>().unwrap(), RestoreMode::Rename);
        assert!(matches!(
            "overwrite".parse::<RestoreMode>(),
            Err(BackupError::UnknownRestoreMode(_))
        ));
    }

    #[test]
    fn test_skippable_kinds() {
        assert!(BackupKind::Automatic.is_skippable());
        assert!(BackupKind::Snapshot.is_skippable());
        assert!(!BackupKind::Manual.is_skippable());
        assert!(!BackupKind::Emergency.is_skippable());
    }
}
