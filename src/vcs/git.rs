//! `git` executable backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use super::{
    relative_key, suggest_fix, CommandOutput, CommitInfo, DiffInfo, FileDiff, RepoStatus,
    VcsError, VersionControl,
};
use crate::config::GitConfig;
use crate::metrics;

const RECORD_SEP: char = '\u{1e}';
const FIELD_SEP: char = '\u{1f}';
const LOG_FORMAT: &str = "--format=%x1e%H%x1f%h%x1f%s%x1f%an%x1f%ae%x1f%aI";

const DEFAULT_IGNORE: &str = "# statekeeper\n.tmp_*\n*.tmp\n.backups/\n";

/// Repository driven through child `git` processes
#[derive(Debug, Clone)]
pub struct GitRepository {
    working_dir: PathBuf,
    program: String,
    timeout: Duration,
    default_branch: String,
    user_name: Option<String>,
    user_email: Option<String>,
}

impl GitRepository {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(working_dir, &GitConfig::default())
    }

    pub fn from_config(working_dir: impl Into<PathBuf>, config: &GitConfig) -> Self {
        Self {
            working_dir: working_dir.into(),
            program: "git".to_string(),
            timeout: config.command_timeout,
            default_branch: config.branch.clone(),
            user_name: config.user_name.clone(),
            user_email: config.user_email.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self.user_email = Some(email.into());
        self
    }

    /// Whether a usable `git` executable is on the path
    pub async fn is_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    async fn execute(&self, operation: &str, args: &[&str]) -> Result<CommandOutput, VcsError> {
        let started = Instant::now();
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .current_dir(&self.working_dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        // dropping the future on timeout kills the child
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(operation, timeout = ?self.timeout, "Version control command timed out");
                metrics::record_vcs_command(operation, "timeout");
                return Err(VcsError::Timeout {
                    operation: operation.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        Ok(CommandOutput {
            operation: operation.to_string(),
            command: format!("{} {}", self.program, args.join(" ")),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            duration: started.elapsed(),
        })
    }

    async fn run(&self, operation: &str, args: &[&str]) -> Result<CommandOutput, VcsError> {
        let output = self.execute(operation, args).await?;
        if output.exit_code == Some(0) {
            debug!(operation, duration = ?output.duration, "Version control command succeeded");
            metrics::record_vcs_command(operation, "success");
            Ok(output)
        } else {
            metrics::record_vcs_command(operation, "failure");
            Err(Self::failure(output))
        }
    }

    fn failure(output: CommandOutput) -> VcsError {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        VcsError::CommandFailed {
            suggestion: suggest_fix(&detail),
            operation: output.operation,
            command: output.command,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: detail,
            duration: output.duration,
        }
    }

    fn path_args(&self, paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| relative_key(&self.working_dir, p))
            .collect()
    }

    async fn ensure_gitignore(&self) -> Result<(), VcsError> {
        let path = self.working_dir.join(".gitignore");
        if !tokio::fs::try_exists(&path).await? {
            tokio::fs::write(&path, DEFAULT_IGNORE).await?;
        }
        Ok(())
    }
}

fn parse_log(operation: &str, raw: &str) -> Result<Vec<CommitInfo>, VcsError> {
    raw.split(RECORD_SEP)
        .filter(|record| !record.trim().is_empty())
        .map(|record| parse_record(operation, record))
        .collect()
}

fn parse_record(operation: &str, record: &str) -> Result<CommitInfo, VcsError> {
    let mut lines = record.lines();
    let header = lines.next().unwrap_or_default();
    let fields: Vec<&str> = header.split(FIELD_SEP).collect();
    if fields.len() != 6 {
        return Err(VcsError::Parse {
            operation: operation.to_string(),
            detail: format!("expected 6 fields, found {}", fields.len()),
        });
    }

    let date = DateTime::parse_from_rfc3339(fields[5])
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| VcsError::Parse {
            operation: operation.to_string(),
            detail: format!("bad commit date {:?}: {}", fields[5], e),
        })?;

    Ok(CommitInfo {
        hash: fields[0].to_string(),
        short_hash: fields[1].to_string(),
        message: fields[2].to_string(),
        author: fields[3].to_string(),
        email: fields[4].to_string(),
        date,
        files: lines
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

fn parse_numstat(from: &str, to: Option<&str>, raw: &str) -> DiffInfo {
    let mut diff = DiffInfo {
        from: from.to_string(),
        to: to.map(str::to_string),
        ..DiffInfo::default()
    };
    for line in raw.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(added), Some(deleted), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let binary = added == "-" && deleted == "-";
        diff.push(FileDiff {
            path: path.to_string(),
            additions: added.parse().unwrap_or(0),
            deletions: deleted.parse().unwrap_or(0),
            binary,
        });
    }
    diff
}

fn parse_status(raw: &str) -> RepoStatus {
    let mut status = RepoStatus::default();
    for line in raw.lines() {
        if let Some(branch_line) = line.strip_prefix("## ") {
            parse_branch_line(branch_line, &mut status);
            continue;
        }
        if line.len() < 4 {
            continue;
        }
        let (code, path) = line.split_at(2);
        let path = path.trim().to_string();
        let mut flags = code.chars();
        let x = flags.next().unwrap_or(' ');
        let y = flags.next().unwrap_or(' ');

        if code == "??" {
            status.untracked.push(path);
        } else if x == 'U' || y == 'U' || code == "AA" || code == "DD" {
            status.conflicted.push(path);
        } else {
            if x != ' ' {
                status.staged.push(path.clone());
            }
            if y == 'M' || y == 'D' {
                status.modified.push(path);
            }
        }
    }
    status
}

fn parse_branch_line(line: &str, status: &mut RepoStatus) {
    if let Some(branch) = line.strip_prefix("No commits yet on ") {
        status.branch = branch.trim().to_string();
        return;
    }
    let (names, tracking) = match line.find(" [") {
        Some(idx) => (&line[..idx], Some(&line[idx + 2..])),
        None => (line, None),
    };
    status.branch = names.split("...").next().unwrap_or(names).to_string();
    if let Some(tracking) = tracking {
        for part in tracking.trim_end_matches(']').split(", ") {
            if let Some(n) = part.strip_prefix("ahead ") {
                status.ahead = n.parse().unwrap_or(0);
            } else if let Some(n) = part.strip_prefix("behind ") {
                status.behind = n.parse().unwrap_or(0);
            }
        }
    }
}

fn is_nothing_to_commit(output: &CommandOutput) -> bool {
    let text = format!("{}\n{}", output.stdout, output.stderr);
    text.contains("nothing to commit")
        || text.contains("nothing added to commit")
        || text.contains("no changes added to commit")
}

fn is_empty_history(stderr: &str) -> bool {
    stderr.contains("does not have any commits") || stderr.contains("bad default revision")
}

#[async_trait]
impl VersionControl for GitRepository {
    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    #[instrument(skip(self), fields(dir = %self.working_dir.display()))]
    async fn init(&self) -> Result<(), VcsError> {
        tokio::fs::create_dir_all(&self.working_dir).await?;
        self.run("init", &["init"]).await?;
        let head_ref = format!("refs/heads/{}", self.default_branch);
        self.run("init", &["symbolic-ref", "HEAD", &head_ref]).await?;
        if let Some(name) = &self.user_name {
            self.run("config", &["config", "user.name", name]).await?;
        }
        if let Some(email) = &self.user_email {
            self.run("config", &["config", "user.email", email]).await?;
        }
        self.ensure_gitignore().await?;
        info!(branch = %self.default_branch, "Initialized repository");
        Ok(())
    }

    async fn is_repository(&self) -> bool {
        matches!(
            self.execute("rev-parse", &["rev-parse", "--is-inside-work-tree"]).await,
            Ok(output) if output.exit_code == Some(0) && output.stdout.trim() == "true"
        )
    }

    async fn add(&self, files: &[PathBuf]) -> Result<(), VcsError> {
        let paths = self.path_args(files);
        let mut args = vec!["add", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run("add", &args).await?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<CommitInfo, VcsError> {
        let output = self.execute("commit", &["commit", "-m", message]).await?;
        if output.exit_code != Some(0) {
            if is_nothing_to_commit(&output) {
                metrics::record_vcs_command("commit", "empty");
                return Err(VcsError::NothingToCommit);
            }
            metrics::record_vcs_command("commit", "failure");
            return Err(Self::failure(output));
        }
        metrics::record_vcs_command("commit", "success");
        self.commit_info("HEAD").await
    }

    async fn log(&self, limit: usize) -> Result<Vec<CommitInfo>, VcsError> {
        let count = format!("-n{}", limit.max(1));
        let output = self
            .execute("log", &["log", &count, "--name-only", LOG_FORMAT])
            .await?;
        if output.exit_code != Some(0) {
            if is_empty_history(&output.stderr) {
                return Ok(Vec::new());
            }
            metrics::record_vcs_command("log", "failure");
            return Err(Self::failure(output));
        }
        metrics::record_vcs_command("log", "success");
        parse_log("log", &output.stdout)
    }

    async fn commit_info(&self, reference: &str) -> Result<CommitInfo, VcsError> {
        let output = self
            .run("show", &["log", "-n1", "--name-only", LOG_FORMAT, reference, "--"])
            .await?;
        parse_log("show", &output.stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| VcsError::UnknownRef(reference.to_string()))
    }

    async fn head(&self) -> Result<Option<CommitInfo>, VcsError> {
        let output = self
            .execute("rev-parse", &["rev-parse", "--verify", "-q", "HEAD"])
            .await?;
        if output.exit_code != Some(0) {
            return Ok(None);
        }
        self.commit_info("HEAD").await.map(Some)
    }

    async fn checkout(&self, reference: &str) -> Result<(), VcsError> {
        self.run("checkout", &["checkout", reference]).await?;
        Ok(())
    }

    async fn checkout_paths(&self, reference: &str, paths: &[PathBuf]) -> Result<(), VcsError> {
        let paths = self.path_args(paths);
        let mut args = vec!["checkout", reference, "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run("checkout", &args).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset(&self, reference: &str, hard: bool) -> Result<(), VcsError> {
        let mode = if hard { "--hard" } else { "--mixed" };
        self.run("reset", &["reset", mode, reference]).await?;
        Ok(())
    }

    async fn diff(&self, from: &str, to: Option<&str>) -> Result<DiffInfo, VcsError> {
        let mut args = vec!["diff", "--numstat", from];
        if let Some(to) = to {
            args.push(to);
        }
        let output = self.run("diff", &args).await?;
        Ok(parse_numstat(from, to, &output.stdout))
    }

    async fn status(&self) -> Result<RepoStatus, VcsError> {
        let output = self.run("status", &["status", "--porcelain", "-b"]).await?;
        Ok(parse_status(&output.stdout))
    }

    async fn create_branch(&self, name: &str) -> Result<(), VcsError> {
        self.run("branch", &["branch", name]).await?;
        Ok(())
    }

    async fn tag(&self, name: &str, reference: &str, message: Option<&str>) -> Result<(), VcsError> {
        match message {
            Some(message) => self.run("tag", &["tag", "-a", name, "-m", message, reference]).await?,
            None => self.run("tag", &["tag", name, reference]).await?,
        };
        Ok(())
    }
}
