// Integration tests for recovery planning and execution
// Version history comes from the in-memory backend unless a test needs real git

use pretty_assertions::assert_eq;
use serde_json::json;
use statekeeper::backup::{BackupManager, BackupRequest, RetentionPolicy};
use statekeeper::recovery::{RecoveryEngine, RecoveryError, RecoveryOptions, RecoveryStrategy, StepType};
use statekeeper::vcs::{GitRepository, MemoryVcs, VersionControl};
use statekeeper::versioning::{ChangeKind, StateVersionManager};
use statekeeper::{BackupConfig, GitConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const GOOD_STATE: &str = r#"{"epics": [{"id": "E-1", "status": "in_progress"}]}"#;
const BROKEN_STATE: &str = r#"{"epics": [{"id": "E-1", "sta"#;

struct Fixture {
    dir: TempDir,
    vcs: Arc<MemoryVcs>,
    versions: Arc<StateVersionManager>,
}

impl Fixture {
    async fn new(config: GitConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let vcs = Arc::new(MemoryVcs::new(dir.path()));
        let versions = Arc::new(StateVersionManager::new(vcs.clone(), config));
        versions.initialize().await.unwrap();
        Self { dir, vcs, versions }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.path(name)).unwrap()
    }

    fn engine(&self) -> RecoveryEngine {
        RecoveryEngine::new(Arc::clone(&self.versions))
    }

    /// Commit good state, then break the file on disk
    async fn committed_then_corrupted(&self, name: &str) -> PathBuf {
        let file = self.write(name, GOOD_STATE);
        self.versions
            .version_state(ChangeKind::State, "seed state", &[file.clone()])
            .await
            .unwrap()
            .unwrap();
        std::fs::write(&file, BROKEN_STATE).unwrap();
        file
    }
}

fn disabled_git() -> GitConfig {
    GitConfig {
        enabled: false,
        ..GitConfig::default()
    }
}

#[tokio::test]
async fn test_plan_without_history_fails() {
    let fixture = Fixture::new(GitConfig::default()).await;
    let file = fixture.write("state.json", BROKEN_STATE);

    let err = fixture
        .engine()
        .create_recovery_plan(&[file], &RecoveryOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, RecoveryError::NoRecoveryPoints));
    assert!(err.to_string().to_lowercase().contains("no suitable recovery points found"));
}

#[tokio::test]
async fn test_plan_with_versioning_disabled_fails() {
    let fixture = Fixture::new(disabled_git()).await;
    let file = fixture.write("state.json", BROKEN_STATE);

    let err = fixture
        .engine()
        .create_recovery_plan(&[file], &RecoveryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::NoRecoveryPoints));
}

#[tokio::test]
async fn test_aggressive_recovery_runs_single_reset() {
    let fixture = Fixture::new(GitConfig::default()).await;
    let file = fixture.committed_then_corrupted("state.json").await;
    let options = RecoveryOptions::new().strategy(RecoveryStrategy::Aggressive);

    let result = fixture
        .engine()
        .auto_recover(&[file.clone()], &options)
        .await
        .unwrap();

    assert_eq!(result.executed_steps.len(), 1);
    assert_eq!(result.executed_steps[0].step_type, StepType::Reset);
    assert!(result.failed_steps.is_empty());
    assert!(result.files_recovered.contains(&file));
    assert!(result.success);
    assert!(result.integrity_verified);
    assert!(result.pre_recovery_ref.is_some());
    assert_eq!(fixture.read("state.json"), GOOD_STATE);
}

#[tokio::test]
async fn test_automatic_recovery_checks_out_and_verifies() {
    let fixture = Fixture::new(GitConfig::default()).await;
    let file = fixture.committed_then_corrupted("state.json").await;

    let result = fixture
        .engine()
        .auto_recover(&[file.clone()], &RecoveryOptions::default())
        .await
        .unwrap();

    let kinds: Vec<StepType> = result.executed_steps.iter().map(|s| s.step_type).collect();
    assert_eq!(kinds, vec![StepType::Checkout, StepType::Verify]);
    assert!(result.success);
    assert_eq!(result.files_recovered, vec![file]);
    assert_eq!(fixture.read("state.json"), GOOD_STATE);

    // the snapshot of the broken file is kept in history but never offered as a target
    let point = result.recovery_point.unwrap();
    assert!(point.description.contains("seed state"));
    let snapshot = fixture
        .vcs
        .commit_info(result.pre_recovery_ref.as_deref().unwrap())
        .await
        .unwrap();
    assert!(snapshot.message.contains("pre-recovery"));
}

#[tokio::test]
async fn test_plan_shapes_per_strategy() {
    let fixture = Fixture::new(GitConfig::default()).await;
    let file = fixture.committed_then_corrupted("state.json").await;
    let engine = fixture.engine();

    let conservative = engine
        .create_recovery_plan(
            &[file.clone()],
            &RecoveryOptions::new().strategy(RecoveryStrategy::Conservative),
        )
        .await
        .unwrap();
    let kinds: Vec<StepType> = conservative.steps.iter().map(|s| s.step_type).collect();
    assert_eq!(kinds, vec![StepType::Analyze, StepType::Checkout]);
    assert!(!conservative.data_loss_risk);

    let aggressive = engine
        .create_recovery_plan(
            &[file.clone()],
            &RecoveryOptions::new().strategy(RecoveryStrategy::Aggressive),
        )
        .await
        .unwrap();
    assert!(aggressive.data_loss_risk);
    assert!(aggressive
        .warnings
        .iter()
        .any(|w| w.contains("data loss")));
    assert_eq!(aggressive.recovery_points.len(), 1);

    // planning alone leaves the file untouched
    assert_eq!(fixture.read("state.json"), BROKEN_STATE);
}

#[tokio::test]
async fn test_interactive_recovery_waits_for_manual_action() {
    let fixture = Fixture::new(GitConfig::default()).await;
    let file = fixture.committed_then_corrupted("state.json").await;
    let options = RecoveryOptions::new().strategy(RecoveryStrategy::Interactive);

    let result = fixture.engine().auto_recover(&[file], &options).await.unwrap();

    assert_eq!(result.executed_steps.len(), 1);
    assert_eq!(result.executed_steps[0].step_type, StepType::Manual);
    assert!(result.warnings.iter().any(|w| w.starts_with("Manual step required")));
    assert!(result.files_recovered.is_empty());
    assert!(!result.integrity_verified);
    assert!(!result.success);
    assert_eq!(fixture.read("state.json"), BROKEN_STATE);
}

#[tokio::test]
async fn test_required_step_failure_aborts_plan() {
    let fixture = Fixture::new(GitConfig::default()).await;
    let file = fixture.committed_then_corrupted("state.json").await;
    let engine = fixture.engine();
    let options = RecoveryOptions::default();
    let plan = engine.create_recovery_plan(&[file], &options).await.unwrap();

    fixture.vcs.inject_failure("checkout");
    let err = engine.execute_recovery_plan(&plan, &options).await.unwrap_err();

    match err {
        RecoveryError::CriticalStepFailed { step_id, result } => {
            assert_eq!(step_id, "checkout_files");
            assert!(!result.success);
            assert_eq!(result.failed_steps.len(), 1);
            assert!(!result.next_steps.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.read("state.json"), BROKEN_STATE);
}

#[tokio::test]
async fn test_time_window_excludes_points() {
    let fixture = Fixture::new(GitConfig::default()).await;
    let file = fixture.committed_then_corrupted("state.json").await;
    let later = chrono::Utc::now() + chrono::Duration::hours(1);
    let options = RecoveryOptions::new().time_window(later, later + chrono::Duration::hours(1));

    let err = fixture
        .engine()
        .create_recovery_plan(&[file], &options)
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::NoRecoveryPoints));
}

#[tokio::test]
async fn test_other_files_history_is_not_a_recovery_point() {
    let fixture = Fixture::new(GitConfig::default()).await;
    fixture.committed_then_corrupted("epic.json").await;
    let file = fixture.write("state.json", BROKEN_STATE);

    let points = fixture
        .engine()
        .find_recovery_points(&[file], &RecoveryOptions::default())
        .await
        .unwrap();
    assert!(points.is_empty());
}

#[tokio::test]
async fn test_automatic_recovery_continues_where_plan_execution_aborts() {
    let fixture = Fixture::new(GitConfig::default()).await;
    let file = fixture.committed_then_corrupted("state.json").await;
    let engine = fixture.engine();
    let options = RecoveryOptions::new().create_backup(false);
    fixture.vcs.inject_failure("checkout");

    // the failed checkout is required, so the automatic run still attempts verification
    let result = engine.auto_recover(&[file.clone()], &options).await.unwrap();
    let failed: Vec<&str> = result.failed_steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(failed, vec!["checkout_files", "verify_integrity"]);
    assert!(result.executed_steps.is_empty());
    assert!(!result.success);
    assert!(!result.integrity_verified);
    assert!(!result.used_backup_fallback);

    let plan = engine.create_recovery_plan(&[file], &options).await.unwrap();
    match engine.execute_recovery_plan(&plan, &options).await.unwrap_err() {
        RecoveryError::CriticalStepFailed { step_id, result } => {
            assert_eq!(step_id, "checkout_files");
            assert_eq!(result.failed_steps.len(), 1);
            assert!(result.executed_steps.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fixture.read("state.json"), BROKEN_STATE);
}

async fn backups_for(dir: &Path) -> BackupManager {
    BackupManager::open(
        BackupConfig::default().with_backup_dir(dir.join(".backups")),
        RetentionPolicy::default(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_falls_back_to_backup_store_without_history() {
    let fixture = Fixture::new(disabled_git()).await;
    let file = fixture.write("state.json", GOOD_STATE);
    let backups = backups_for(fixture.dir.path()).await;
    backups.create_backup(BackupRequest::new(&file)).await.unwrap();
    std::fs::write(&file, BROKEN_STATE).unwrap();

    let engine = fixture.engine().with_backup_manager(backups.clone());
    let result = engine
        .auto_recover(&[file.clone()], &RecoveryOptions::default())
        .await
        .unwrap();

    assert!(result.used_backup_fallback);
    assert!(result.success);
    assert_eq!(result.executed_steps.len(), 1);
    assert_eq!(result.executed_steps[0].step_type, StepType::Restore);
    assert_eq!(result.files_recovered, vec![file]);
    assert_eq!(fixture.read("state.json"), GOOD_STATE);
    assert_eq!(backups.stats().total_recoveries, 1);
}

#[tokio::test]
async fn test_fallback_without_backups_reports_no_points() {
    let fixture = Fixture::new(disabled_git()).await;
    let file = fixture.write("state.json", BROKEN_STATE);
    let backups = backups_for(fixture.dir.path()).await;
    let engine = fixture.engine().with_backup_manager(backups);

    let err = engine
        .auto_recover(&[file], &RecoveryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::NoRecoveryPoints));
}

#[tokio::test]
async fn test_same_name_in_subdirectory_does_not_block_backup_fallback() {
    let fixture = Fixture::new(GitConfig::default()).await;
    std::fs::create_dir_all(fixture.path("docs")).unwrap();
    let nested = fixture.write("docs/state.json", GOOD_STATE);
    fixture
        .versions
        .version_state(ChangeKind::State, "nested only", &[nested])
        .await
        .unwrap()
        .unwrap();

    let file = fixture.write("state.json", GOOD_STATE);
    let backups = backups_for(fixture.dir.path()).await;
    backups.create_backup(BackupRequest::new(&file)).await.unwrap();
    std::fs::write(&file, BROKEN_STATE).unwrap();

    let engine = fixture.engine().with_backup_manager(backups);
    let points = engine
        .find_recovery_points(&[file.clone()], &RecoveryOptions::default())
        .await
        .unwrap();
    assert!(points.is_empty());

    let result = engine
        .auto_recover(&[file.clone()], &RecoveryOptions::new().create_backup(false))
        .await
        .unwrap();
    assert!(result.used_backup_fallback);
    assert!(result.success);
    assert!(result.failed_steps.is_empty());
    assert_eq!(fixture.read("state.json"), GOOD_STATE);
    assert_eq!(fixture.read("docs/state.json"), GOOD_STATE);
}

#[tokio::test]
async fn test_recovery_with_git_executable() {
    if !GitRepository::is_available().await {
        eprintln!("git not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let vcs = Arc::new(GitRepository::new(dir.path()).with_user("State Keeper", "keeper@example.com"));
    let versions = Arc::new(StateVersionManager::new(vcs, GitConfig::default()));
    versions.initialize().await.unwrap();

    let file = dir.path().join("state.json");
    std::fs::write(&file, serde_json::to_vec(&json!({"tasks": ["T-1", "T-2"]})).unwrap()).unwrap();
    versions
        .version_state(ChangeKind::Task, "add tasks", &[file.clone()])
        .await
        .unwrap()
        .unwrap();
    std::fs::write(&file, BROKEN_STATE).unwrap();

    let engine = RecoveryEngine::new(Arc::clone(&versions));
    let result = engine
        .auto_recover(&[file.clone()], &RecoveryOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    let restored: serde_json::Value = serde_json::from_slice(&std::fs::read(&file).unwrap()).unwrap();
    assert_eq!(restored, json!({"tasks": ["T-1", "T-2"]}));
}
