//! Planning and execution of recoveries

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use super::plan::{
    CorruptionSeverity, RecoveryOptions, RecoveryPlan, RecoveryResult, RecoveryStep, RecoveryStrategy,
    RiskLevel, StepReport, StepType,
};
use super::RecoveryError;
use crate::backup::{BackupManager, RecoveryRequest, RestoreMode};
use crate::integrity::CorruptionScanner;
use crate::metrics;
use crate::vcs::relative_key;
use crate::versioning::{ChangeKind, RecoveryPoint, StateVersionManager};

/// Recovery points offered by a single search
const MAX_RECOVERY_POINTS: usize = 10;

/// Snapshot commits never serve as recovery targets
const SNAPSHOT_MARKER: &str = "pre-recovery";

// Both sides are repo-relative keys with `/` separators
fn paths_match(commit_file: &str, key: &str) -> bool {
    commit_file.trim_start_matches("./") == key.trim_start_matches("./")
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(7)]
}

pub struct RecoveryEngine {
    versions: Arc<StateVersionManager>,
    scanner: Arc<dyn CorruptionScanner>,
    backups: Option<BackupManager>,
}

impl RecoveryEngine {
    pub fn new(versions: Arc<StateVersionManager>) -> Self {
        Self {
            scanner: versions.scanner(),
            versions,
            backups: None,
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn CorruptionScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Backup store consulted when history holds no recovery point
    pub fn with_backup_manager(mut self, backups: BackupManager) -> Self {
        self.backups = Some(backups);
        self
    }

    pub fn versions(&self) -> &Arc<StateVersionManager> {
        &self.versions
    }

    fn effective_files(&self, corrupted: &[PathBuf], options: &RecoveryOptions) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Vec::new();
        for file in corrupted.iter().chain(options.target_files.iter()) {
            let resolved = self.versions.resolve(file);
            if !files.contains(&resolved) {
                files.push(resolved);
            }
        }
        files
    }

    /// Snapshot, plan, execute and verify
    ///
    /// Step failures are recorded in the result rather than returned. For the
    /// automatic strategy execution stops at the first failing optional step.
    #[instrument(skip(self, corrupted_files, options), fields(strategy = %options.strategy, files = corrupted_files.len()))]
    pub async fn auto_recover(
        &self,
        corrupted_files: &[PathBuf],
        options: &RecoveryOptions,
    ) -> Result<RecoveryResult, RecoveryError> {
        let started = Instant::now();
        let files = self.effective_files(corrupted_files, options);
        let mut result = RecoveryResult::new(options.strategy, files.clone());
        info!("Starting recovery");

        let mut snapshot_taken = false;
        if options.create_backup {
            result.pre_recovery_ref = self.pre_recovery_snapshot(&files).await?;
            snapshot_taken = true;
        }

        let plan = match self.build_plan(&files, options).await {
            Ok(plan) => plan,
            Err(RecoveryError::NoRecoveryPoints) if options.backup_fallback && self.backups.is_some() => {
                return self.recover_from_backups(files, options, result, started).await;
            }
            Err(e) => {
                metrics::record_recovery(options.strategy.as_str(), "failure", started.elapsed());
                return Err(e);
            }
        };
        result.recovery_point = plan.target().cloned();
        result.warnings.extend(plan.warnings.iter().cloned());

        if plan.data_loss_risk && !options.allow_data_loss && !snapshot_taken {
            warn!("Plan risks data loss, taking pre-recovery snapshot");
            result.pre_recovery_ref = self.pre_recovery_snapshot(&files).await?;
        }

        for step in &plan.steps {
            let report = self.execute_step(step, &mut result).await;
            if report.success {
                result.executed_steps.push(report);
                continue;
            }
            result
                .warnings
                .push(format!("Step failed: {} - {}", step.id, report.message));
            result.failed_steps.push(report);
            if options.strategy == RecoveryStrategy::Automatic && !step.required {
                break;
            }
        }

        self.finish(&mut result, &files, options.verify_integrity, started).await;
        Ok(result)
    }

    /// Search history for recovery points and build a plan for `options.strategy`
    pub async fn create_recovery_plan(
        &self,
        corrupted_files: &[PathBuf],
        options: &RecoveryOptions,
    ) -> Result<RecoveryPlan, RecoveryError> {
        let files = self.effective_files(corrupted_files, options);
        self.build_plan(&files, options).await
    }

    async fn build_plan(&self, files: &[PathBuf], options: &RecoveryOptions) -> Result<RecoveryPlan, RecoveryError> {
        let points = self.find_recovery_points(files, options).await?;
        if points.is_empty() {
            return Err(RecoveryError::NoRecoveryPoints);
        }

        let mut reports = Vec::with_capacity(files.len());
        for file in files {
            reports.push(self.scanner.scan_file(file).await);
        }
        let severity = CorruptionSeverity::classify(&reports);

        let plan = RecoveryPlan::assemble(options.strategy, points, severity, files.to_vec());
        info!(
            strategy = %plan.strategy,
            steps = plan.steps.len(),
            risk = ?plan.risk,
            severity = ?plan.severity,
            data_loss_risk = plan.data_loss_risk,
            "Recovery plan created"
        );
        Ok(plan)
    }

    /// Commits touching `files`, newest first, at most ten
    pub async fn find_recovery_points(
        &self,
        files: &[PathBuf],
        options: &RecoveryOptions,
    ) -> Result<Vec<RecoveryPoint>, RecoveryError> {
        if !self.versions.is_enabled() {
            return Ok(Vec::new());
        }
        let vcs = self.versions.vcs();
        let keys: Vec<String> = files
            .iter()
            .map(|f| relative_key(vcs.working_dir(), &self.versions.resolve(f)))
            .collect();

        let commits = vcs.log(options.max_search_depth).await?;
        let mut points: Vec<RecoveryPoint> = commits
            .into_iter()
            .filter(|c| !c.message.contains(SNAPSHOT_MARKER))
            .filter(|c| options.time_window.as_ref().map_or(true, |w| w.contains(c.date)))
            .filter(|c| {
                keys.is_empty()
                    || c.files
                        .iter()
                        .any(|cf| keys.iter().any(|k| paths_match(cf, k)))
            })
            .take(MAX_RECOVERY_POINTS)
            .map(|commit| RecoveryPoint {
                description: commit.message.clone(),
                files: commit.files.clone(),
                verified: false,
                safe: true,
                automatic: commit.message.contains("backup:"),
                tag: None,
                commit,
            })
            .collect();
        points.sort_by(|a, b| b.commit.date.cmp(&a.commit.date));

        debug!(found = points.len(), "Recovery point search finished");
        Ok(points)
    }

    /// Run every step; a failing required step aborts with [`RecoveryError::CriticalStepFailed`]
    #[instrument(skip(self, plan, options), fields(strategy = %plan.strategy, steps = plan.steps.len()))]
    pub async fn execute_recovery_plan(
        &self,
        plan: &RecoveryPlan,
        options: &RecoveryOptions,
    ) -> Result<RecoveryResult, RecoveryError> {
        let started = Instant::now();
        let mut result = RecoveryResult::new(plan.strategy, plan.corrupted_files.clone());
        result.recovery_point = plan.target().cloned();

        for step in &plan.steps {
            let report = self.execute_step(step, &mut result).await;
            if report.success {
                result.executed_steps.push(report);
                continue;
            }
            result
                .warnings
                .push(format!("Step '{}' failed: {}", step.id, report.message));
            result.failed_steps.push(report);
            if step.required {
                result.success = false;
                result.duration = started.elapsed();
                result.suggest_next_steps();
                metrics::record_recovery(plan.strategy.as_str(), "failure", result.duration);
                return Err(RecoveryError::CriticalStepFailed {
                    step_id: step.id.clone(),
                    result: Box::new(result),
                });
            }
        }

        if options.verify_integrity {
            result.integrity_verified = self.corrupted(&plan.corrupted_files).await.is_empty();
        }
        result.success = result.failed_steps.is_empty();
        result.duration = started.elapsed();
        result.suggest_next_steps();
        metrics::record_recovery(
            plan.strategy.as_str(),
            if result.success { "success" } else { "failure" },
            result.duration,
        );
        Ok(result)
    }

    async fn execute_step(&self, step: &RecoveryStep, result: &mut RecoveryResult) -> StepReport {
        let outcome = self.run_step(step, result).await;
        let (success, message) = match outcome {
            Ok(message) => (true, message),
            Err(e) => {
                warn!(step = %step.id, error = %e, "Recovery step failed");
                (false, e.to_string())
            }
        };
        StepReport {
            step_id: step.id.clone(),
            step_type: step.step_type,
            success,
            message,
            files: step.files.clone(),
        }
    }

    async fn run_step(&self, step: &RecoveryStep, result: &mut RecoveryResult) -> Result<String, RecoveryError> {
        let target = || {
            step.target
                .as_deref()
                .ok_or_else(|| RecoveryError::MissingTarget(step.id.clone()))
        };

        match step.step_type {
            StepType::Checkout => {
                let target = target()?;
                if !step.files.is_empty() {
                    self.versions.vcs().checkout_paths(target, &step.files).await?;
                }
                result.files_recovered.extend(step.files.iter().cloned());
                Ok(format!("Checked out {} files from {}", step.files.len(), short(target)))
            }
            StepType::Reset => {
                let target = target()?;
                self.versions.vcs().reset(target, true).await?;
                result.files_recovered.extend(step.files.iter().cloned());
                Ok(format!("Working tree reset to {}", short(target)))
            }
            StepType::Verify => {
                let corrupted = self.corrupted(&step.files).await;
                if corrupted.is_empty() {
                    Ok(format!("{} files verified", step.files.len()))
                } else {
                    Err(RecoveryError::StillCorrupted(corrupted))
                }
            }
            StepType::Analyze => {
                let mut issues = 0;
                for file in &step.files {
                    issues += self.scanner.scan_file(file).await.issues.len();
                }
                Ok(format!("{} issues found across {} files", issues, step.files.len()))
            }
            StepType::Manual => {
                result
                    .warnings
                    .push(format!("Manual step required: {}", step.description));
                Ok("Awaiting manual action".to_string())
            }
            StepType::Restore => {
                let backups = self
                    .backups
                    .as_ref()
                    .ok_or_else(|| RecoveryError::MissingTarget(step.id.clone()))?;
                for file in &step.files {
                    let request = RecoveryRequest::for_source(file)
                        .mode(RestoreMode::Replace)
                        .verify(true, true)
                        .create_backup(true);
                    let restored = backups.recover_from_backup(request).await?;
                    result.warnings.extend(restored.warnings);
                    result.files_recovered.push(file.clone());
                }
                Ok(format!("Restored {} files from backups", step.files.len()))
            }
        }
    }

    async fn recover_from_backups(
        &self,
        files: Vec<PathBuf>,
        options: &RecoveryOptions,
        mut result: RecoveryResult,
        started: Instant,
    ) -> Result<RecoveryResult, RecoveryError> {
        if files.is_empty() {
            return Err(RecoveryError::NoRecoveryPoints);
        }
        info!(files = files.len(), "No recovery points in history, restoring from backups");
        result.used_backup_fallback = true;

        let step = RecoveryStep {
            id: "restore_from_backup".to_string(),
            step_type: StepType::Restore,
            description: "Restore files from their latest backups".to_string(),
            target: None,
            files: files.clone(),
            risk: RiskLevel::Low,
            reversible: true,
            required: true,
            automated: true,
            estimated: Duration::from_secs(5),
        };
        let report = self.execute_step(&step, &mut result).await;
        if report.success {
            result.executed_steps.push(report);
        } else if result.files_recovered.is_empty() {
            metrics::record_recovery(options.strategy.as_str(), "failure", started.elapsed());
            return Err(RecoveryError::NoRecoveryPoints);
        } else {
            result
                .warnings
                .push(format!("Step failed: {} - {}", step.id, report.message));
            result.failed_steps.push(report);
        }

        self.finish(&mut result, &files, options.verify_integrity, started).await;
        Ok(result)
    }

    async fn finish(&self, result: &mut RecoveryResult, files: &[PathBuf], verify: bool, started: Instant) {
        if verify {
            result.integrity_verified = self.corrupted(files).await.is_empty();
            if !result.integrity_verified {
                result.warnings.push("Recovery integrity check failed".to_string());
            }
        }
        result.success = result.failed_steps.is_empty() && (result.integrity_verified || !verify);
        result.duration = started.elapsed();
        result.suggest_next_steps();

        metrics::record_recovery(
            result.strategy.as_str(),
            if result.success { "success" } else { "failure" },
            result.duration,
        );
        info!(
            success = result.success,
            recovered = result.files_recovered.len(),
            failed_steps = result.failed_steps.len(),
            "Recovery finished"
        );
    }

    /// Commit the current content of `files` and tag it
    ///
    /// Falls back to HEAD when there is nothing new to commit.
    async fn pre_recovery_snapshot(&self, files: &[PathBuf]) -> Result<Option<String>, RecoveryError> {
        if !self.versions.is_enabled() {
            return Ok(None);
        }
        let stamp = Utc::now().timestamp();
        let mut existing = Vec::new();
        for file in files {
            if fs::try_exists(file).await.unwrap_or(false) {
                existing.push(file.clone());
            }
        }

        let commit = if existing.is_empty() {
            None
        } else {
            self.versions
                .version_state(
                    ChangeKind::Backup,
                    &format!("{}-backup-{}", SNAPSHOT_MARKER, stamp),
                    &existing,
                )
                .await
                .map_err(RecoveryError::Snapshot)?
        };

        let vcs = self.versions.vcs();
        match commit {
            Some(commit) => {
                let tag = format!("{}/{}", SNAPSHOT_MARKER, stamp);
                if let Err(e) = vcs.tag(&tag, &commit.hash, Some("pre-recovery snapshot")).await {
                    warn!(tag = %tag, error = %e, "Failed to tag pre-recovery snapshot");
                }
                info!(commit = %commit.short_hash, "Pre-recovery snapshot created");
                Ok(Some(commit.hash))
            }
            None => {
                let head = vcs
                    .head()
                    .await
                    .map_err(|e| RecoveryError::Snapshot(e.into()))?;
                Ok(head.map(|c| c.hash))
            }
        }
    }

    async fn corrupted(&self, files: &[PathBuf]) -> Vec<PathBuf> {
        let mut corrupted = Vec::new();
        for file in files {
            if self.scanner.scan_file(file).await.is_corrupted {
                corrupted.push(file.clone());
            }
        }
        corrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_match_whole_keys_only() {
        assert!(paths_match("state.json", "state.json"));
        assert!(paths_match("./docs/state.json", "docs/state.json"));
        assert!(!paths_match("docs/state.json", "state.json"));
        assert!(!paths_match("state.json", "docs/state.json"));
        assert!(!paths_match("docs/otherstate.json", "state.json"));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short("0123456789"), "0123456");
        assert_eq!(short("abc"), "abc");
    }
}
