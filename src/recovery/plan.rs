//! Recovery strategies, plans and results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::RecoveryError;
use crate::integrity::{CorruptionReport, IssueSeverity};
use crate::versioning::RecoveryPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStrategy {
    /// Check the files out of the newest recovery point, then verify
    Automatic,
    /// Human-guided choice of approach
    Interactive,
    /// Analyze first, restore selectively after review
    Conservative,
    /// Hard reset of the whole tree
    Aggressive,
}

impl RecoveryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Interactive => "interactive",
            Self::Conservative => "conservative",
            Self::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryStrategy {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "automatic" => Ok(Self::Automatic),
            "interactive" => Ok(Self::Interactive),
            "conservative" => Ok(Self::Conservative),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(RecoveryError::UnknownStrategy(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Checkout,
    Reset,
    Verify,
    Analyze,
    Manual,
    /// Restore from the backup store
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptionSeverity {
    Low,
    Medium,
    High,
}

impl CorruptionSeverity {
    /// `high` on any critical issue, `medium` on more than two major ones
    pub fn classify(reports: &[CorruptionReport]) -> Self {
        let critical: usize = reports.iter().map(|r| r.count(IssueSeverity::Critical)).sum();
        let major: usize = reports.iter().map(|r| r.count(IssueSeverity::Major)).sum();
        if critical > 0 {
            Self::High
        } else if major > 2 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub id: String,
    pub step_type: StepType,
    pub description: String,
    /// Commit the step operates against
    pub target: Option<String>,
    pub files: Vec<PathBuf>,
    pub risk: RiskLevel,
    pub reversible: bool,
    pub required: bool,
    pub automated: bool,
    pub estimated: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryOptions {
    pub strategy: RecoveryStrategy,
    /// Commits of history searched for recovery points
    pub max_search_depth: usize,
    pub verify_integrity: bool,
    pub create_backup: bool,
    pub allow_data_loss: bool,
    /// Extra files restored alongside the corrupted ones
    pub target_files: Vec<PathBuf>,
    pub time_window: Option<TimeWindow>,
    /// Restore from the backup store when history has no recovery point
    pub backup_fallback: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            strategy: RecoveryStrategy::Automatic,
            max_search_depth: 50,
            verify_integrity: true,
            create_backup: true,
            allow_data_loss: false,
            target_files: Vec::new(),
            time_window: None,
            backup_fallback: true,
        }
    }
}

impl RecoveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_search_depth(mut self, depth: usize) -> Self {
        self.max_search_depth = depth;
        self
    }

    pub fn verify_integrity(mut self, enabled: bool) -> Self {
        self.verify_integrity = enabled;
        self
    }

    pub fn create_backup(mut self, enabled: bool) -> Self {
        self.create_backup = enabled;
        self
    }

    pub fn allow_data_loss(mut self, allowed: bool) -> Self {
        self.allow_data_loss = allowed;
        self
    }

    pub fn target_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.target_files.push(path.into());
        self
    }

    pub fn time_window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_window = Some(TimeWindow { start, end });
        self
    }

    pub fn backup_fallback(mut self, enabled: bool) -> Self {
        self.backup_fallback = enabled;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub strategy: RecoveryStrategy,
    pub steps: Vec<RecoveryStep>,
    /// Candidates, newest first; steps target the first
    pub recovery_points: Vec<RecoveryPoint>,
    pub severity: CorruptionSeverity,
    pub risk: RiskLevel,
    pub data_loss_risk: bool,
    pub estimated_duration: Duration,
    pub warnings: Vec<String>,
    pub prerequisites: Vec<String>,
    pub corrupted_files: Vec<PathBuf>,
}

impl RecoveryPlan {
    /// Build the step list for `strategy` and score it
    pub(crate) fn assemble(
        strategy: RecoveryStrategy,
        recovery_points: Vec<RecoveryPoint>,
        severity: CorruptionSeverity,
        files: Vec<PathBuf>,
    ) -> Self {
        let steps = match recovery_points.first() {
            Some(point) => strategy_steps(strategy, point, &files),
            None => Vec::new(),
        };

        let estimated_duration = steps.iter().map(|s| s.estimated).sum();
        let data_loss_risk = steps.iter().any(|s| !s.reversible);
        let risk = if steps.iter().any(|s| s.risk == RiskLevel::High) {
            RiskLevel::High
        } else if steps.len() > 3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let mut warnings = Vec::new();
        let mut prerequisites = Vec::new();
        if data_loss_risk {
            warnings.push("Recovery may result in data loss".to_string());
            prerequisites.push("Create backup before proceeding".to_string());
        }
        if severity == CorruptionSeverity::High {
            warnings.push("High corruption detected - recovery may be incomplete".to_string());
        }

        Self {
            strategy,
            steps,
            recovery_points,
            severity,
            risk,
            data_loss_risk,
            estimated_duration,
            warnings,
            prerequisites,
            corrupted_files: files,
        }
    }

    pub fn target(&self) -> Option<&RecoveryPoint> {
        self.recovery_points.first()
    }
}

#[allow(clippy::too_many_arguments)]
fn step(
    id: &str,
    step_type: StepType,
    description: String,
    target: Option<&str>,
    files: &[PathBuf],
    risk: RiskLevel,
    flags: (bool, bool, bool),
    estimated_secs: u64,
) -> RecoveryStep {
    let (reversible, required, automated) = flags;
    RecoveryStep {
        id: id.to_string(),
        step_type,
        description,
        target: target.map(str::to_string),
        files: files.to_vec(),
        risk,
        reversible,
        required,
        automated,
        estimated: Duration::from_secs(estimated_secs),
    }
}

fn strategy_steps(strategy: RecoveryStrategy, point: &RecoveryPoint, files: &[PathBuf]) -> Vec<RecoveryStep> {
    let hash = Some(point.commit.hash.as_str());
    let short = &point.commit.short_hash;
    match strategy {
        RecoveryStrategy::Automatic => vec![
            step(
                "checkout_files",
                StepType::Checkout,
                format!("Restore files from commit {}", short),
                hash,
                files,
                RiskLevel::Low,
                (true, true, true),
                5,
            ),
            step(
                "verify_integrity",
                StepType::Verify,
                "Verify recovered files integrity".to_string(),
                None,
                files,
                RiskLevel::Low,
                (true, false, true),
                2,
            ),
        ],
        RecoveryStrategy::Conservative => vec![
            step(
                "analyze_corruption",
                StepType::Analyze,
                "Analyze corruption patterns".to_string(),
                None,
                files,
                RiskLevel::Low,
                (true, false, true),
                3,
            ),
            step(
                "selective_restore",
                StepType::Checkout,
                format!("Selectively restore corrupted files from commit {}", short),
                hash,
                files,
                RiskLevel::Low,
                (true, true, false),
                10,
            ),
        ],
        RecoveryStrategy::Aggressive => vec![step(
            "hard_reset",
            StepType::Reset,
            format!("Hard reset working tree to commit {}", short),
            hash,
            files,
            RiskLevel::High,
            (false, true, true),
            3,
        )],
        RecoveryStrategy::Interactive => vec![step(
            "user_review",
            StepType::Manual,
            "Review recovery options and select approach".to_string(),
            hash,
            files,
            RiskLevel::Low,
            (true, true, false),
            30,
        )],
    }
}

/// Outcome of one executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub step_type: StepType,
    pub success: bool,
    pub message: String,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub strategy: RecoveryStrategy,
    pub executed_steps: Vec<StepReport>,
    pub failed_steps: Vec<StepReport>,
    pub files_recovered: Vec<PathBuf>,
    pub corrupted_files: Vec<PathBuf>,
    pub integrity_verified: bool,
    /// Commit holding the state from before the recovery
    pub pre_recovery_ref: Option<String>,
    pub recovery_point: Option<RecoveryPoint>,
    pub used_backup_fallback: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub next_steps: Vec<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryResult {
    pub(crate) fn new(strategy: RecoveryStrategy, corrupted_files: Vec<PathBuf>) -> Self {
        Self {
            success: false,
            strategy,
            executed_steps: Vec::new(),
            failed_steps: Vec::new(),
            files_recovered: Vec::new(),
            corrupted_files,
            integrity_verified: false,
            pre_recovery_ref: None,
            recovery_point: None,
            used_backup_fallback: false,
            warnings: Vec::new(),
            errors: Vec::new(),
            next_steps: Vec::new(),
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn suggest_next_steps(&mut self) {
        let steps: &[&str] = if self.success {
            &[
                "Verify application functionality",
                "Consider additional testing",
                "Monitor for recurring issues",
            ]
        } else {
            &[
                "Review recovery logs",
                "Consider manual recovery",
                "Contact support if issues persist",
            ]
        };
        self.next_steps = steps.iter().map(|s| s.to_string()).collect();
    }
}
