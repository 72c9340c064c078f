//! Versioning of state files through a [`VersionControl`] backend

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, error, info, instrument, warn};

use super::{ChangeKind, RecoveryPoint, VersionError};
use crate::config::GitConfig;
use crate::integrity::{AutoVersion, CorruptionDetector, CorruptionScanner};
use crate::vcs::{CommitInfo, DiffInfo, RepoStatus, VcsError, VersionControl};

/// Outcome of [`StateVersionManager::cleanup_old_versions`]; history is never rewritten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCleanupReport {
    /// Commits seen, counting at most `max_commits + 1`
    pub commit_count: usize,
    pub max_commits: usize,
    pub cleanup_needed: bool,
}

/// Human description for a state file, used when a write supplies none
pub fn description_from_path(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = path
        .parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    let lower = file_name.to_lowercase();

    if lower.contains("project") {
        format!("update project state in {}", dir)
    } else if lower.contains("epic") {
        format!("update epic state in {}", dir)
    } else if lower.contains("story") {
        format!("update story state in {}", dir)
    } else if lower.contains("task") || lower.contains("todo") {
        format!("update task state in {}", dir)
    } else {
        format!("update {}", file_name)
    }
}

pub struct StateVersionManager {
    vcs: Arc<dyn VersionControl>,
    config: GitConfig,
    auto_commit: AtomicBool,
    scanner: Arc<dyn CorruptionScanner>,
}

impl StateVersionManager {
    pub fn new(vcs: Arc<dyn VersionControl>, config: GitConfig) -> Self {
        Self {
            auto_commit: AtomicBool::new(config.auto_commit),
            vcs,
            config,
            scanner: Arc::new(CorruptionDetector::new()),
        }
    }

    /// Scanner used to verify restored files and recovery points
    pub fn with_scanner(mut self, scanner: Arc<dyn CorruptionScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    pub fn vcs(&self) -> Arc<dyn VersionControl> {
        Arc::clone(&self.vcs)
    }

    pub fn scanner(&self) -> Arc<dyn CorruptionScanner> {
        Arc::clone(&self.scanner)
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_auto_commit(&self, enabled: bool) {
        self.auto_commit.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::SeqCst)
    }

    /// Create the repository if it does not exist yet
    pub async fn initialize(&self) -> Result<(), VersionError> {
        if !self.config.enabled {
            return Ok(());
        }
        if !self.vcs.is_repository().await {
            self.vcs.init().await?;
            info!(working_dir = %self.vcs.working_dir().display(), "Initialized state repository");
        }
        Ok(())
    }

    /// Relative paths are taken from the repository root
    pub(crate) fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.vcs.working_dir().join(path)
        }
    }

    fn ensure_enabled(&self) -> Result<(), VersionError> {
        if self.config.enabled {
            Ok(())
        } else {
            Err(VersionError::Disabled)
        }
    }

    /// Stage and commit `files`
    ///
    /// Returns `Ok(None)` when version control is disabled or the files have no
    /// net changes.
    #[instrument(skip(self, files), fields(kind = kind.as_str(), files = files.len()))]
    pub async fn version_state(
        &self,
        kind: ChangeKind,
        description: &str,
        files: &[PathBuf],
    ) -> Result<Option<CommitInfo>, VersionError> {
        if !self.config.enabled {
            return Ok(None);
        }
        if files.is_empty() {
            return Err(VersionError::EmptyFileList);
        }

        let files: Vec<PathBuf> = files.iter().map(|f| self.resolve(f)).collect();
        for file in &files {
            if !fs::try_exists(file).await.unwrap_or(false) {
                return Err(VersionError::FileNotFound(file.clone()));
            }
        }

        self.vcs.add(&files).await?;
        match self.vcs.commit(&kind.message(description)).await {
            Ok(commit) => {
                info!(commit = %commit.short_hash, "State versioned");
                Ok(Some(commit))
            }
            Err(VcsError::NothingToCommit) => {
                debug!("No changes to version");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit a file right after it was written, if auto-commit is on
    pub async fn auto_version_on_write(
        &self,
        path: &Path,
        kind: ChangeKind,
        description: Option<&str>,
    ) -> Result<Option<CommitInfo>, VersionError> {
        if !self.config.enabled || !self.auto_commit() {
            return Ok(None);
        }
        let description = description
            .map(str::to_string)
            .unwrap_or_else(|| description_from_path(path));
        self.version_state(kind, &description, &[path.to_path_buf()]).await
    }

    /// Commit `files`, tag the commit and record whether they scan clean
    pub async fn create_recovery_point(
        &self,
        name: &str,
        description: &str,
        files: &[PathBuf],
    ) -> Result<RecoveryPoint, VersionError> {
        self.ensure_enabled()?;
        let commit = self
            .version_state(ChangeKind::Backup, description, files)
            .await?
            .ok_or(VersionError::NothingToCommit)?;

        let tag = format!("recovery/{}/{}", name, Utc::now().timestamp());
        self.vcs.tag(&tag, &commit.hash, Some(description)).await?;

        let resolved: Vec<PathBuf> = files.iter().map(|f| self.resolve(f)).collect();
        let verified = self.corrupted_files(&resolved).await.is_empty();
        info!(tag = %tag, commit = %commit.short_hash, verified, "Recovery point created");

        Ok(RecoveryPoint {
            files: commit.files.clone(),
            commit,
            description: description.to_string(),
            verified,
            safe: verified,
            automatic: false,
            tag: Some(tag),
        })
    }

    /// Commits that look like state snapshots, newest first and unverified
    pub async fn get_recovery_points(&self, limit: usize) -> Result<Vec<RecoveryPoint>, VersionError> {
        self.ensure_enabled()?;
        let commits = self.vcs.log(limit).await?;
        Ok(commits
            .into_iter()
            .filter(|c| {
                c.message.contains("backup:")
                    || c.message.contains("chore(state):")
                    || c.message.contains("feat(")
            })
            .map(|commit| RecoveryPoint {
                description: commit.message.clone(),
                files: commit.files.clone(),
                verified: false,
                safe: true,
                automatic: commit.message.contains("backup:"),
                tag: None,
                commit,
            })
            .collect())
    }

    /// Restore `files` from `point`
    ///
    /// The current content is committed first. If a checkout fails or the restored
    /// files do not scan clean, the files are checked back out from that commit.
    /// Returns the commit recording the recovery, when one was made.
    #[instrument(skip(self, point, files), fields(point = %point.commit.short_hash))]
    pub async fn recover_to_point(
        &self,
        point: &RecoveryPoint,
        files: &[PathBuf],
    ) -> Result<Option<CommitInfo>, VersionError> {
        self.ensure_enabled()?;
        if files.is_empty() {
            return Err(VersionError::EmptyFileList);
        }
        let files: Vec<PathBuf> = files.iter().map(|f| self.resolve(f)).collect();
        let rollback = self.snapshot_before_recovery(&files).await?;

        for file in &files {
            if let Err(source) = self
                .vcs
                .checkout_paths(&point.commit.hash, std::slice::from_ref(file))
                .await
            {
                error!(file = %file.display(), error = %source, "Checkout from recovery point failed");
                self.roll_back(rollback.as_deref(), &files).await;
                return Err(VersionError::Checkout {
                    file: file.clone(),
                    source,
                });
            }
        }

        let corrupted = self.corrupted_files(&files).await;
        if !corrupted.is_empty() {
            warn!(corrupted = corrupted.len(), "Restored state failed integrity check, rolling back");
            self.roll_back(rollback.as_deref(), &files).await;
            return Err(VersionError::VerificationFailed {
                point: point.commit.short_hash.clone(),
                files: corrupted,
            });
        }

        let message = format!("restore from {} ({})", point.commit.short_hash, point.description);
        let commit = match self.version_state(ChangeKind::Recovery, &message, &files).await {
            Ok(commit) => commit,
            Err(e) => {
                warn!(error = %e, "Failed to commit recovery");
                None
            }
        };
        info!(files = files.len(), "Recovered state from point");
        Ok(commit)
    }

    /// Commit what exists of `files` before overwriting them; falls back to HEAD
    pub(crate) async fn snapshot_before_recovery(&self, files: &[PathBuf]) -> Result<Option<String>, VersionError> {
        let mut existing = Vec::new();
        for file in files {
            if fs::try_exists(file).await.unwrap_or(false) {
                existing.push(file.clone());
            }
        }
        let commit = if existing.is_empty() {
            None
        } else {
            self.version_state(ChangeKind::Backup, "pre-recovery backup", &existing)
                .await?
        };
        match commit {
            Some(commit) => Ok(Some(commit.hash)),
            None => Ok(self.vcs.head().await?.map(|c| c.hash)),
        }
    }

    async fn roll_back(&self, reference: Option<&str>, files: &[PathBuf]) {
        let Some(reference) = reference else {
            warn!("No rollback reference available");
            return;
        };
        for file in files {
            if let Err(e) = self
                .vcs
                .checkout_paths(reference, std::slice::from_ref(file))
                .await
            {
                warn!(file = %file.display(), error = %e, "Rollback checkout failed");
            }
        }
    }

    /// Files among `files` that the scanner reports as corrupted
    pub(crate) async fn corrupted_files(&self, files: &[PathBuf]) -> Vec<PathBuf> {
        let mut corrupted = Vec::new();
        for file in files {
            if self.scanner.scan_file(file).await.is_corrupted {
                corrupted.push(file.clone());
            }
        }
        corrupted
    }

    /// Changes from `reference` to HEAD
    pub async fn get_state_diff(&self, reference: &str) -> Result<DiffInfo, VersionError> {
        self.ensure_enabled()?;
        Ok(self.vcs.diff(reference, Some("HEAD")).await?)
    }

    /// Report whether history exceeds `max_commits`
    pub async fn cleanup_old_versions(&self) -> Result<VersionCleanupReport, VersionError> {
        let max_commits = self.config.max_commits;
        if !self.config.enabled || max_commits == 0 {
            return Ok(VersionCleanupReport {
                commit_count: 0,
                max_commits,
                cleanup_needed: false,
            });
        }
        let commit_count = self.vcs.log(max_commits.saturating_add(1)).await?.len();
        let cleanup_needed = commit_count > max_commits;
        if cleanup_needed {
            warn!(commit_count, max_commits, "History exceeds configured commit limit");
        }
        Ok(VersionCleanupReport {
            commit_count,
            max_commits,
            cleanup_needed,
        })
    }

    pub async fn get_repository_status(&self) -> Result<RepoStatus, VersionError> {
        self.ensure_enabled()?;
        Ok(self.vcs.status().await?)
    }

    pub async fn has_uncommitted_changes(&self) -> Result<bool, VersionError> {
        if !self.config.enabled {
            return Ok(false);
        }
        Ok(!self.vcs.status().await?.is_clean())
    }

    pub async fn last_commit(&self) -> Result<Option<CommitInfo>, VersionError> {
        self.ensure_enabled()?;
        Ok(self.vcs.head().await?)
    }
}

#[async_trait]
impl AutoVersion for StateVersionManager {
    async fn auto_version(
        &self,
        path: &Path,
        change_kind: &str,
        description: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        let commit = self
            .auto_version_on_write(path, ChangeKind::from(change_kind), description)
            .await?;
        Ok(commit.map(|c| c.hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::MemoryVcs;
    use pretty_assertions::assert_eq;

    async fn setup() -> (tempfile::TempDir, Arc<MemoryVcs>, StateVersionManager) {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new(dir.path()));
        let manager = StateVersionManager::new(vcs.clone(), GitConfig::default());
        manager.initialize().await.unwrap();
        (dir, vcs, manager)
    }

    #[test]
    fn test_description_from_path() {
        assert_eq!(
            description_from_path(Path::new("/p/docs/epics.json")),
            "update epic state in docs"
        );
        assert_eq!(
            description_from_path(Path::new("/p/state/todo.json")),
            "update task state in state"
        );
        assert_eq!(description_from_path(Path::new("/p/misc.json")), "update misc.json");
    }

    #[tokio::test]
    async fn test_version_state_commits_with_template() {
        let (dir, _vcs, manager) = setup().await;
        std::fs::write(dir.path().join("story.json"), br#"{"id": 1}"#).unwrap();

        let commit = manager
            .version_state(ChangeKind::Story, "add story", &[PathBuf::from("story.json")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(commit.message, "feat(story): add story");
        assert_eq!(commit.files, vec!["story.json".to_string()]);

        let again = manager
            .version_state(ChangeKind::Story, "add story", &[PathBuf::from("story.json")])
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_version_state_input_errors() {
        let (_dir, _vcs, manager) = setup().await;
        assert!(matches!(
            manager.version_state(ChangeKind::State, "x", &[]).await,
            Err(VersionError::EmptyFileList)
        ));
        assert!(matches!(
            manager
                .version_state(ChangeKind::State, "x", &[PathBuf::from("missing.json")])
                .await,
            Err(VersionError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = GitConfig {
            enabled: false,
            ..GitConfig::default()
        };
        let manager = StateVersionManager::new(Arc::new(MemoryVcs::new(dir.path())), config);
        assert!(manager.version_state(ChangeKind::State, "x", &[]).await.unwrap().is_none());
        assert!(matches!(
            manager.get_recovery_points(10).await,
            Err(VersionError::Disabled)
        ));
    }

    #[tokio::test]
    async fn test_auto_version_respects_toggle() {
        let (dir, vcs, manager) = setup().await;
        let file = dir.path().join("project.json");
        std::fs::write(&file, b"{}").unwrap();

        manager.set_auto_commit(false);
        assert!(manager.auto_version_on_write(&file, ChangeKind::Project, None).await.unwrap().is_none());
        assert_eq!(vcs.commit_count(), 0);

        manager.set_auto_commit(true);
        let commit = manager
            .auto_version_on_write(&file, ChangeKind::Project, None)
            .await
            .unwrap()
            .unwrap();
        assert!(commit.message.starts_with("feat(project): update project state in"));
    }

    #[tokio::test]
    async fn test_recovery_points_filter_messages() {
        let (dir, vcs, manager) = setup().await;
        let file = dir.path().join("state.json");
        std::fs::write(&file, b"{\"v\": 1}").unwrap();
        manager.version_state(ChangeKind::Backup, "one", &[file.clone()]).await.unwrap();
        std::fs::write(&file, b"{\"v\": 2}").unwrap();
        vcs.add(&[file.clone()]).await.unwrap();
        vcs.commit("docs: unrelated").await.unwrap();
        std::fs::write(&file, b"{\"v\": 3}").unwrap();
        manager.version_state(ChangeKind::State, "three", &[file.clone()]).await.unwrap();

        let points = manager.get_recovery_points(10).await.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].commit.message, "chore(state): three");
        assert!(!points[0].automatic);
        assert!(points[1].automatic);
    }

    #[tokio::test]
    async fn test_create_recovery_point_tags_and_verifies() {
        let (dir, _vcs, manager) = setup().await;
        let file = dir.path().join("state.json");
        std::fs::write(&file, br#"{"tasks": [1]}"#).unwrap();

        let point = manager
            .create_recovery_point("release", "before release", &[file.clone()])
            .await
            .unwrap();
        assert!(point.verified);
        assert!(point.tag.as_deref().unwrap().starts_with("recovery/release/"));

        let err = manager
            .create_recovery_point("release", "again", &[file])
            .await
            .unwrap_err();
        assert!(matches!(err, VersionError::NothingToCommit));
    }

    #[tokio::test]
    async fn test_recover_to_point_restores_content() {
        let (dir, _vcs, manager) = setup().await;
        let file = dir.path().join("state.json");
        std::fs::write(&file, br#"{"tasks": [1, 2]}"#).unwrap();
        let point = manager
            .create_recovery_point("good", "known good", &[file.clone()])
            .await
            .unwrap();

        std::fs::write(&file, b"{\"tasks\": [1, 2").unwrap();
        let commit = manager.recover_to_point(&point, &[file.clone()]).await.unwrap();

        assert_eq!(std::fs::read(&file).unwrap(), br#"{"tasks": [1, 2]}"#.to_vec());
        assert!(commit.unwrap().message.starts_with("recover: restore from"));
    }

    #[tokio::test]
    async fn test_recover_to_corrupted_point_rolls_back() {
        let (dir, _vcs, manager) = setup().await;
        let file = dir.path().join("state.json");
        std::fs::write(&file, b"{\"broken\": ").unwrap();
        let bad_point = manager
            .create_recovery_point("bad", "corrupted snapshot", &[file.clone()])
            .await
            .unwrap();
        assert!(!bad_point.verified);

        let current = br#"{"current": true}"#.to_vec();
        std::fs::write(&file, &current).unwrap();
        let err = manager.recover_to_point(&bad_point, &[file.clone()]).await.unwrap_err();

        assert!(matches!(err, VersionError::VerificationFailed { .. }));
        assert_eq!(std::fs::read(&file).unwrap(), current);
    }

    #[tokio::test]
    async fn test_state_diff_and_status() {
        let (dir, _vcs, manager) = setup().await;
        let file = dir.path().join("state.json");
        std::fs::write(&file, "{\"v\": 1}\n").unwrap();
        let first = manager
            .version_state(ChangeKind::State, "one", &[file.clone()])
            .await
            .unwrap()
            .unwrap();

        std::fs::write(&file, "{\n  \"v\": 2\n}\n").unwrap();
        assert!(manager.has_uncommitted_changes().await.unwrap());
        let status = manager.get_repository_status().await.unwrap();
        assert_eq!(status.modified, vec!["state.json".to_string()]);
        manager.version_state(ChangeKind::State, "two", &[file]).await.unwrap();
        assert!(!manager.has_uncommitted_changes().await.unwrap());

        let diff = manager.get_state_diff(&first.hash).await.unwrap();
        assert_eq!(diff.files.len(), 1);
        assert_eq!(diff.files[0].path, "state.json");
        assert_eq!((diff.additions, diff.deletions), (3, 1));
        assert_eq!(manager.last_commit().await.unwrap().unwrap().message, "chore(state): two");
    }

    #[tokio::test]
    async fn test_cleanup_only_reports() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new(dir.path()));
        let config = GitConfig {
            max_commits: 2,
            ..GitConfig::default()
        };
        let manager = StateVersionManager::new(vcs.clone(), config);
        manager.initialize().await.unwrap();
        let file = dir.path().join("state.json");
        for i in 0..4 {
            std::fs::write(&file, format!("{{\"v\": {}}}", i)).unwrap();
            manager.version_state(ChangeKind::State, "v", &[file.clone()]).await.unwrap();
        }

        let report = manager.cleanup_old_versions().await.unwrap();
        assert!(report.cleanup_needed);
        assert_eq!(report.commit_count, 3);
        assert_eq!(vcs.commit_count(), 4);
    }
}
