//! Version-control primitives
//!
//! [`VersionControl`] is the capability the versioning and recovery layers consume.
//! [`GitRepository`] drives the `git` executable with a per-call timeout and
//! [`MemoryVcs`] keeps the whole history in memory for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub mod git;
pub mod memory;

pub use git::GitRepository;
pub use memory::MemoryVcs;

/// A single commit as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub short_hash: String,
    pub message: String,
    pub author: String,
    pub email: String,
    pub date: DateTime<Utc>,
    /// Paths changed by the commit, relative to the repository root
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub additions: usize,
    pub deletions: usize,
    pub binary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffInfo {
    pub from: String,
    pub to: Option<String>,
    pub files: Vec<FileDiff>,
    pub additions: usize,
    pub deletions: usize,
}

impl DiffInfo {
    pub(crate) fn push(&mut self, file: FileDiff) {
        self.additions += file.additions;
        self.deletions += file.deletions;
        self.files.push(file);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub branch: String,
    pub ahead: usize,
    pub behind: usize,
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
}

impl RepoStatus {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.modified.is_empty()
            && self.untracked.is_empty()
            && self.conflicted.is_empty()
    }
}

/// Captured output of one backend command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub operation: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("{operation} failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        operation: String,
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        suggestion: String,
        duration: Duration,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Nothing to commit")]
    NothingToCommit,

    #[error("Unknown reference: {0}")]
    UnknownRef(String),

    #[error("Not a repository: {0}")]
    NotARepository(PathBuf),

    #[error("Failed to run version control: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected output from {operation}: {detail}")]
    Parse { operation: String, detail: String },
}

impl VcsError {
    /// Human hint for resolving the failure, when one is known
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { suggestion, .. } => Some(suggestion),
            Self::Timeout { .. } => Some("The repository may be locked or very large; retry later"),
            Self::NotARepository(_) => Some("Initialize the repository first"),
            Self::UnknownRef(_) => Some("Check the commit hash, tag or branch name"),
            _ => None,
        }
    }
}

/// Map raw error output to a suggestion
pub(crate) fn suggest_fix(stderr: &str) -> String {
    let lower = stderr.to_lowercase();
    let hint = if lower.contains("not a git repository") {
        "Initialize the repository first"
    } else if lower.contains("index.lock") {
        "Another process holds the index lock; remove a stale .git/index.lock if none is running"
    } else if lower.contains("pathspec") || lower.contains("did not match") {
        "Check that the file paths exist inside the repository"
    } else if lower.contains("permission denied") {
        "Check file and directory permissions"
    } else if lower.contains("conflict") {
        "Resolve merge conflicts before continuing"
    } else if lower.contains("unknown revision") || lower.contains("bad revision") {
        "Check the commit hash, tag or branch name"
    } else if lower.contains("please tell me who you are") {
        "Configure user.name and user.email for the repository"
    } else {
        "Check the version control output for details"
    };
    hint.to_string()
}

/// Operations the state layers need from a version-control backend
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Root of the working tree
    fn working_dir(&self) -> &Path;

    async fn init(&self) -> Result<(), VcsError>;

    async fn is_repository(&self) -> bool;

    async fn add(&self, files: &[PathBuf]) -> Result<(), VcsError>;

    /// Commit staged changes; [`VcsError::NothingToCommit`] when nothing is staged
    async fn commit(&self, message: &str) -> Result<CommitInfo, VcsError>;

    /// Most recent commits on the current branch, newest first
    async fn log(&self, limit: usize) -> Result<Vec<CommitInfo>, VcsError>;

    async fn commit_info(&self, reference: &str) -> Result<CommitInfo, VcsError>;

    /// Current commit, `None` for a repository without commits
    async fn head(&self) -> Result<Option<CommitInfo>, VcsError>;

    async fn checkout(&self, reference: &str) -> Result<(), VcsError>;

    /// Restore the given paths from `reference` without moving HEAD
    async fn checkout_paths(&self, reference: &str, paths: &[PathBuf]) -> Result<(), VcsError>;

    async fn reset(&self, reference: &str, hard: bool) -> Result<(), VcsError>;

    /// Diff `from` against `to`, or against the working tree when `to` is `None`
    async fn diff(&self, from: &str, to: Option<&str>) -> Result<DiffInfo, VcsError>;

    async fn status(&self) -> Result<RepoStatus, VcsError>;

    async fn create_branch(&self, name: &str) -> Result<(), VcsError>;

    async fn tag(&self, name: &str, reference: &str, message: Option<&str>) -> Result<(), VcsError>;
}

/// Express `path` relative to `root` with forward slashes
pub(crate) fn relative_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_key_strips_root() {
        let root = Path::new("/work/project");
        assert_eq!(relative_key(root, Path::new("/work/project/epics/e1.json")), "epics/e1.json");
        assert_eq!(relative_key(root, Path::new("state.json")), "state.json");
    }

    #[test]
    fn test_suggestions() {
        assert_eq!(
            suggest_fix("fatal: not a git repository (or any of the parent directories)"),
            "Initialize the repository first"
        );
        assert!(suggest_fix("error: pathspec 'x' did not match any file(s)").contains("file paths"));
    }
}
