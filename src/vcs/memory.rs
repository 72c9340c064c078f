//! In-memory version-control backend
//!
//! Commits snapshot file contents read from the real working directory, and checkouts
//! and hard resets write them back, so recovery flows can be exercised end to end
//! without a `git` executable.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{relative_key, CommitInfo, DiffInfo, FileDiff, RepoStatus, VcsError, VersionControl};
use crate::integrity::sha256_bytes;

type Tree = BTreeMap<String, Vec<u8>>;

struct MemoryCommit {
    info: CommitInfo,
    parent: Option<usize>,
    tree: Tree,
}

#[derive(Default)]
struct MemoryRepo {
    initialized: bool,
    commits: Vec<MemoryCommit>,
    head: Option<usize>,
    branch: String,
    branches: HashMap<String, Option<usize>>,
    tags: HashMap<String, usize>,
    // None marks a staged deletion
    staged: BTreeMap<String, Option<Vec<u8>>>,
    failures: HashSet<String>,
}

impl MemoryRepo {
    fn head_tree(&self) -> Tree {
        self.head
            .map(|idx| self.commits[idx].tree.clone())
            .unwrap_or_default()
    }

    fn resolve(&self, reference: &str) -> Result<usize, VcsError> {
        let unknown = || VcsError::UnknownRef(reference.to_string());
        if reference == "HEAD" {
            return self.head.ok_or_else(unknown);
        }
        if let Some(steps) = reference.strip_prefix("HEAD~") {
            let steps: usize = steps.parse().map_err(|_| unknown())?;
            let mut current = self.head.ok_or_else(unknown)?;
            for _ in 0..steps {
                current = self.commits[current].parent.ok_or_else(unknown)?;
            }
            return Ok(current);
        }
        if let Some(idx) = self.tags.get(reference) {
            return Ok(*idx);
        }
        if let Some(target) = self.branches.get(reference) {
            return target.ok_or_else(unknown);
        }
        if reference.len() >= 4 {
            if let Some(idx) = self
                .commits
                .iter()
                .position(|c| c.info.hash.starts_with(reference))
            {
                return Ok(idx);
            }
        }
        Err(unknown())
    }

    fn check_failure(&self, operation: &str) -> Result<(), VcsError> {
        if self.failures.contains(operation) {
            return Err(VcsError::CommandFailed {
                operation: operation.to_string(),
                command: format!("memory {}", operation),
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("injected {} failure", operation),
                suggestion: "Injected failure".to_string(),
                duration: Duration::ZERO,
            });
        }
        Ok(())
    }
}

/// Version control kept entirely in memory
pub struct MemoryVcs {
    working_dir: PathBuf,
    repo: Mutex<MemoryRepo>,
    author: String,
    email: String,
}

impl MemoryVcs {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            repo: Mutex::new(MemoryRepo {
                branch: "main".to_string(),
                ..MemoryRepo::default()
            }),
            author: "statekeeper".to_string(),
            email: "statekeeper@localhost".to_string(),
        }
    }

    /// Make every later call of `operation` fail until cleared
    pub fn inject_failure(&self, operation: &str) {
        self.repo.lock().failures.insert(operation.to_string());
    }

    pub fn clear_failures(&self) {
        self.repo.lock().failures.clear();
    }

    pub fn commit_count(&self) -> usize {
        self.repo.lock().commits.len()
    }

    fn key(&self, path: &Path) -> String {
        relative_key(&self.working_dir, path)
    }

    fn guard(&self, operation: &str) -> Result<(), VcsError> {
        let repo = self.repo.lock();
        if !repo.initialized {
            return Err(VcsError::NotARepository(self.working_dir.clone()));
        }
        repo.check_failure(operation)
    }

    async fn write_tree(&self, files: &Tree, remove: &[String]) -> Result<(), VcsError> {
        for key in remove {
            match tokio::fs::remove_file(self.working_dir.join(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        for (key, content) in files {
            let path = self.working_dir.join(key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
        }
        Ok(())
    }

    /// Move HEAD to `target` and make the working tree match it
    async fn switch_tree(&self, target: usize, branch: Option<String>) -> Result<(), VcsError> {
        let (tree, stale) = {
            let mut repo = self.repo.lock();
            let current = repo.head_tree();
            let tree = repo.commits[target].tree.clone();
            let stale: Vec<String> = current.keys().filter(|k| !tree.contains_key(*k)).cloned().collect();
            repo.head = Some(target);
            if let Some(branch) = branch {
                repo.branch = branch;
            } else {
                let name = repo.branch.clone();
                repo.branches.insert(name, Some(target));
            }
            repo.staged.clear();
            (tree, stale)
        };
        self.write_tree(&tree, &stale).await
    }

    async fn read_worktree(&self, keys: impl Iterator<Item = String>) -> BTreeMap<String, Option<Vec<u8>>> {
        let mut contents = BTreeMap::new();
        for key in keys {
            let data = tokio::fs::read(self.working_dir.join(&key)).await.ok();
            contents.insert(key, data);
        }
        contents
    }
}

fn line_count(data: &[u8]) -> usize {
    String::from_utf8_lossy(data).lines().count()
}

fn tree_diff(from: &Tree, to: &BTreeMap<String, Option<Vec<u8>>>) -> Vec<FileDiff> {
    let mut files = Vec::new();
    let keys: std::collections::BTreeSet<&String> = from.keys().chain(to.keys()).collect();
    for key in keys {
        let old = from.get(key);
        let new = to.get(key).and_then(|v| v.as_ref());
        if old == new {
            continue;
        }
        files.push(FileDiff {
            path: key.clone(),
            additions: new.map(|d| line_count(d)).unwrap_or(0),
            deletions: old.map(|d| line_count(d)).unwrap_or(0),
            binary: false,
        });
    }
    files
}

#[async_trait]
impl VersionControl for MemoryVcs {
    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    async fn init(&self) -> Result<(), VcsError> {
        tokio::fs::create_dir_all(&self.working_dir).await?;
        self.repo.lock().initialized = true;
        Ok(())
    }

    async fn is_repository(&self) -> bool {
        self.repo.lock().initialized
    }

    async fn add(&self, files: &[PathBuf]) -> Result<(), VcsError> {
        self.guard("add")?;
        let contents = self.read_worktree(files.iter().map(|p| self.key(p))).await;
        let mut repo = self.repo.lock();
        let tracked = repo.head_tree();
        for (key, data) in contents {
            if data.is_none() && !tracked.contains_key(&key) && !repo.staged.contains_key(&key) {
                return Err(VcsError::CommandFailed {
                    operation: "add".to_string(),
                    command: format!("memory add {}", key),
                    exit_code: Some(128),
                    stdout: String::new(),
                    stderr: format!("pathspec '{}' did not match any files", key),
                    suggestion: super::suggest_fix("pathspec did not match"),
                    duration: Duration::ZERO,
                });
            }
            repo.staged.insert(key, data);
        }
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<CommitInfo, VcsError> {
        self.guard("commit")?;
        let mut repo = self.repo.lock();
        let parent_tree = repo.head_tree();
        let mut tree = parent_tree.clone();
        let mut changed = Vec::new();
        for (key, data) in std::mem::take(&mut repo.staged) {
            let before = parent_tree.get(&key);
            if before == data.as_ref() {
                continue;
            }
            changed.push(key.clone());
            match data {
                Some(bytes) => {
                    tree.insert(key, bytes);
                }
                None => {
                    tree.remove(&key);
                }
            }
        }
        if changed.is_empty() {
            return Err(VcsError::NothingToCommit);
        }

        let seed = format!("{}:{}:{}:{:?}", repo.commits.len(), message, Utc::now(), changed);
        let hash = sha256_bytes(seed.as_bytes())[..40].to_string();
        let info = CommitInfo {
            short_hash: hash[..7].to_string(),
            hash,
            message: message.to_string(),
            author: self.author.clone(),
            email: self.email.clone(),
            date: Utc::now(),
            files: changed,
        };
        let parent = repo.head;
        repo.commits.push(MemoryCommit {
            info: info.clone(),
            parent,
            tree,
        });
        let idx = repo.commits.len() - 1;
        repo.head = Some(idx);
        let branch = repo.branch.clone();
        repo.branches.insert(branch, Some(idx));
        Ok(info)
    }

    async fn log(&self, limit: usize) -> Result<Vec<CommitInfo>, VcsError> {
        self.guard("log")?;
        let repo = self.repo.lock();
        let mut commits = Vec::new();
        let mut current = repo.head;
        while let Some(idx) = current {
            if commits.len() >= limit {
                break;
            }
            commits.push(repo.commits[idx].info.clone());
            current = repo.commits[idx].parent;
        }
        Ok(commits)
    }

    async fn commit_info(&self, reference: &str) -> Result<CommitInfo, VcsError> {
        self.guard("show")?;
        let repo = self.repo.lock();
        let idx = repo.resolve(reference)?;
        Ok(repo.commits[idx].info.clone())
    }

    async fn head(&self) -> Result<Option<CommitInfo>, VcsError> {
        self.guard("rev-parse")?;
        let repo = self.repo.lock();
        Ok(repo.head.map(|idx| repo.commits[idx].info.clone()))
    }

    async fn checkout(&self, reference: &str) -> Result<(), VcsError> {
        self.guard("checkout")?;
        let (target, branch) = {
            let repo = self.repo.lock();
            let target = repo.resolve(reference)?;
            let branch = repo
                .branches
                .contains_key(reference)
                .then(|| reference.to_string());
            (target, branch)
        };
        self.switch_tree(target, branch).await
    }

    async fn checkout_paths(&self, reference: &str, paths: &[PathBuf]) -> Result<(), VcsError> {
        self.guard("checkout")?;
        let mut files = Tree::new();
        {
            let repo = self.repo.lock();
            let tree = &repo.commits[repo.resolve(reference)?].tree;
            for path in paths {
                let key = self.key(path);
                let content = tree.get(&key).ok_or_else(|| VcsError::CommandFailed {
                    operation: "checkout".to_string(),
                    command: format!("memory checkout {} -- {}", reference, key),
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: format!("pathspec '{}' did not match any file(s) known to git", key),
                    suggestion: super::suggest_fix("pathspec did not match"),
                    duration: Duration::ZERO,
                })?;
                files.insert(key, content.clone());
            }
        }
        self.write_tree(&files, &[]).await
    }

    async fn reset(&self, reference: &str, hard: bool) -> Result<(), VcsError> {
        self.guard("reset")?;
        let target = self.repo.lock().resolve(reference)?;
        if hard {
            self.switch_tree(target, None).await
        } else {
            let mut repo = self.repo.lock();
            repo.head = Some(target);
            let branch = repo.branch.clone();
            repo.branches.insert(branch, Some(target));
            repo.staged.clear();
            Ok(())
        }
    }

    async fn diff(&self, from: &str, to: Option<&str>) -> Result<DiffInfo, VcsError> {
        self.guard("diff")?;
        let (from_tree, to_tree) = {
            let repo = self.repo.lock();
            let from_tree = repo.commits[repo.resolve(from)?].tree.clone();
            let to_tree = match to {
                Some(to) => Some(repo.commits[repo.resolve(to)?].tree.clone()),
                None => None,
            };
            (from_tree, to_tree)
        };
        let target = match to_tree {
            Some(tree) => tree.into_iter().map(|(k, v)| (k, Some(v))).collect(),
            None => {
                let head_keys: Vec<String> = self.repo.lock().head_tree().keys().cloned().collect();
                let keys: std::collections::BTreeSet<String> =
                    from_tree.keys().cloned().chain(head_keys).collect();
                self.read_worktree(keys.into_iter()).await
            }
        };

        let mut diff = DiffInfo {
            from: from.to_string(),
            to: to.map(str::to_string),
            ..DiffInfo::default()
        };
        for file in tree_diff(&from_tree, &target) {
            diff.push(file);
        }
        Ok(diff)
    }

    async fn status(&self) -> Result<RepoStatus, VcsError> {
        self.guard("status")?;
        let (tracked, staged, branch) = {
            let repo = self.repo.lock();
            (
                repo.head_tree(),
                repo.staged.keys().cloned().collect::<Vec<_>>(),
                repo.branch.clone(),
            )
        };
        let current = self.read_worktree(tracked.keys().cloned()).await;
        let modified = current
            .iter()
            .filter(|(key, data)| tracked.get(*key) != data.as_ref())
            .map(|(key, _)| key.clone())
            .collect();

        Ok(RepoStatus {
            branch,
            staged,
            modified,
            ..RepoStatus::default()
        })
    }

    async fn create_branch(&self, name: &str) -> Result<(), VcsError> {
        self.guard("branch")?;
        let mut repo = self.repo.lock();
        let head = repo.head;
        repo.branches.insert(name.to_string(), head);
        Ok(())
    }

    async fn tag(&self, name: &str, reference: &str, _message: Option<&str>) -> Result<(), VcsError> {
        self.guard("tag")?;
        let mut repo = self.repo.lock();
        let idx = repo.resolve(reference)?;
        repo.tags.insert(name.to_string(), idx);
        Ok(())
    }
}
