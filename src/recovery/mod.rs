//! Recovery of corrupted state files
//!
//! The [`RecoveryEngine`] searches version history for commits touching the
//! corrupted files, builds a risk-scored [`RecoveryPlan`] for the chosen
//! [`RecoveryStrategy`] and runs its steps in order. When history has nothing
//! to offer it can fall back to the backup store.

use std::path::PathBuf;
use thiserror::Error;

use crate::backup::BackupError;
use crate::vcs::VcsError;
use crate::versioning::VersionError;

pub mod engine;
pub mod plan;

pub use engine::RecoveryEngine;
pub use plan::{
    CorruptionSeverity, RecoveryOptions, RecoveryPlan, RecoveryResult, RecoveryStep, RecoveryStrategy,
    RiskLevel, StepReport, StepType, TimeWindow,
};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("No suitable recovery points found")]
    NoRecoveryPoints,

    #[error("Unknown recovery strategy: {0}")]
    UnknownStrategy(String),

    #[error("Pre-recovery snapshot failed: {0}")]
    Snapshot(#[source] VersionError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error("Critical recovery step failed: {step_id}")]
    CriticalStepFailed {
        step_id: String,
        result: Box<RecoveryResult>,
    },

    #[error("Step {0} has no target commit")]
    MissingTarget(String),

    #[error("Files still corrupted after recovery: {0:?}")]
    StillCorrupted(Vec<PathBuf>),
}
