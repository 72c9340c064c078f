//! State versioning on top of a version-control backend
//!
//! Commits state files with messages templated by change kind, tags recovery
//! points and restores files from them with automatic rollback when the
//! restored content fails an integrity scan.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::vcs::{CommitInfo, VcsError};

pub mod manager;

pub use manager::{description_from_path, StateVersionManager, VersionCleanupReport};

/// Kind of change being committed; selects the message template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Project,
    Epic,
    Story,
    Task,
    State,
    Backup,
    Recovery,
    Migration,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Epic => "epic",
            Self::Story => "story",
            Self::Task => "task",
            Self::State => "state",
            Self::Backup => "backup",
            Self::Recovery => "recovery",
            Self::Migration => "migration",
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::Project => "feat(project): ",
            Self::Epic => "feat(epic): ",
            Self::Story => "feat(story): ",
            Self::Task => "fix(task): ",
            Self::State => "chore(state): ",
            Self::Backup => "backup: ",
            Self::Recovery => "recover: ",
            Self::Migration => "migrate: ",
        }
    }

    /// Commit message for this kind of change
    pub fn message(&self, description: &str) -> String {
        format!("{}{}", self.prefix(), description)
    }
}

impl From<&str> for ChangeKind {
    /// Unknown names map to [`ChangeKind::State`]
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "project" => Self::Project,
            "epic" => Self::Epic,
            "story" => Self::Story,
            "task" => Self::Task,
            "backup" => Self::Backup,
            "recovery" | "recover" => Self::Recovery,
            "migration" | "migrate" => Self::Migration,
            _ => Self::State,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A commit that can serve as a restoration target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub commit: CommitInfo,
    pub description: String,
    pub files: Vec<String>,
    /// Files passed an integrity scan when the point was recorded
    pub verified: bool,
    pub safe: bool,
    /// Created by an automatic backup commit rather than by hand
    pub automatic: bool,
    pub tag: Option<String>,
}

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("Version control integration is disabled")]
    Disabled,

    #[error("No files specified for versioning")]
    EmptyFileList,

    #[error("File does not exist: {0}")]
    FileNotFound(PathBuf),

    #[error("No changes to record")]
    NothingToCommit,

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error("State restored from {point} failed integrity check: {files:?}")]
    VerificationFailed { point: String, files: Vec<PathBuf> },

    #[error("Failed to check out {file}: {source}")]
    Checkout {
        file: PathBuf,
        #[source]
        source: VcsError,
    },
}
