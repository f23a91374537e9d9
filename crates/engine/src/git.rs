// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Git isolation and merge-back.
//!
//! Each task works against a private clone under its task directory; the
//! host repository is only ever mutated by [`merge_back`] and
//! [`delete_task_ref`]. Task commits are always fetched into the host as
//! `refs/tasks/<task_id>` before any merge is attempted, so the work
//! survives every merge outcome until the ref is explicitly deleted.

use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use mvo_core::{fsio, TaskId, TaskPaths};

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {args} in {} failed: {stderr}", .dir.display())]
    Command { args: String, dir: PathBuf, stderr: String },

    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

/// Host state captured at task creation time.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    /// Commit hash of the host's HEAD; the merge base for merge-back.
    pub start_ref: String,
    /// Active branch, or `None` on a detached HEAD.
    pub branch: Option<String>,
}

/// Result of merging task commits back into the host repository.
///
/// Serialized verbatim as `merge-result.json` and embedded in events.
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub merged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub commits: u64,
    pub conflicts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MergeOutcome {
    fn base(merged: bool) -> Self {
        Self {
            merged,
            method: None,
            commits: 0,
            conflicts: Vec::new(),
            reason: None,
            task_ref: None,
            error: None,
        }
    }

    /// The clone produced no commits; nothing to merge.
    pub fn noop() -> Self {
        Self { method: Some("noop".into()), ..Self::base(true) }
    }

    pub fn fast_forward(commits: u64) -> Self {
        Self { method: Some("fast-forward".into()), commits, ..Self::base(true) }
    }

    pub fn rebase(commits: u64) -> Self {
        Self { method: Some("rebase".into()), commits, ..Self::base(true) }
    }

    pub fn conflicts(paths: Vec<String>, task_ref: String, commits: u64) -> Self {
        Self {
            reason: Some("conflicts".into()),
            conflicts: paths,
            task_ref: Some(task_ref),
            commits,
            ..Self::base(false)
        }
    }

    pub fn detached_head(task_ref: String, commits: u64) -> Self {
        Self {
            reason: Some("detached-head".into()),
            task_ref: Some(task_ref),
            commits,
            ..Self::base(false)
        }
    }

    pub fn error(message: String, task_ref: Option<String>) -> Self {
        Self {
            reason: Some("error".into()),
            error: Some(message),
            task_ref,
            ..Self::base(false)
        }
    }

    pub fn failed_with_reason(&self, reason: &str) -> bool {
        !self.merged && self.reason.as_deref() == Some(reason)
    }
}

/// The preservation ref for a task on the host repository.
pub fn task_ref_name(task_id: &TaskId) -> String {
    format!("refs/tasks/{task_id}")
}

/// Branch name used inside the isolated clone.
fn clone_branch(task_id: &TaskId) -> String {
    format!("task-{}", task_id.short())
}

fn run_git(
    dir: &Path,
    args: &[&str],
    envs: &[(&str, &OsStr)],
) -> Result<std::process::Output, GitError> {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    Ok(cmd.output()?)
}

/// Run git and fail on non-zero exit; returns trimmed stdout.
fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    git_env(dir, args, &[])
}

fn git_env(dir: &Path, args: &[&str], envs: &[(&str, &OsStr)]) -> Result<String, GitError> {
    let output = run_git(dir, args, envs)?;
    if !output.status.success() {
        return Err(GitError::Command {
            args: args.join(" "),
            dir: dir.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run git and swallow the failure; returns stdout on success.
fn git_try(dir: &Path, args: &[&str]) -> Option<String> {
    match run_git(dir, args, &[]) {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        Ok(output) => {
            debug!(args = args.join(" "), dir = %dir.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "lenient git command failed");
            None
        }
        Err(e) => {
            debug!(args = args.join(" "), error = %e, "lenient git command could not run");
            None
        }
    }
}

/// Current HEAD commit of a repository.
pub fn current_ref(repo: &Path) -> Result<String, GitError> {
    git(repo, &["rev-parse", "HEAD"])
}

/// Current branch, or `None` when HEAD is detached.
pub fn current_branch(repo: &Path) -> Option<String> {
    git_try(repo, &["symbolic-ref", "--short", "HEAD"]).filter(|s| !s.is_empty())
}

/// Set up the isolated clone for a task and capture the host snapshot.
///
/// Initializes `task_dir/repo`, fetches the host's HEAD into it, and checks
/// out a task branch at the captured start ref. Git inside the clone runs
/// with an isolated `GIT_CONFIG_GLOBAL` carrying `safe.directory = *` and a
/// per-task committer identity, so the in-guest agent never touches the
/// host user's git configuration. Writes `start-ref` and `task-id` into the
/// task directory.
pub fn setup_isolated_repo(
    host_repo: &Path,
    paths: &TaskPaths,
    task_id: &TaskId,
) -> Result<RepoSnapshot, GitError> {
    let start_ref = current_ref(host_repo)?;
    let branch = current_branch(host_repo);

    let clone_dir = paths.repo();
    std::fs::create_dir_all(&clone_dir)?;
    write_isolated_config(paths, task_id)?;

    let clone = CloneCtx { dir: clone_dir.clone(), config: paths.git_config() };
    clone.git(&["init", "--quiet"])?;
    clone.git(&["remote", "add", "origin", &host_repo.display().to_string()])?;

    let fetched = clone
        .git(&["fetch", "--no-tags", "--quiet", "origin", "HEAD"])
        .and_then(|_| clone.git(&["checkout", "--quiet", "-b", &clone_branch(task_id), &start_ref]));

    if let Err(e) = fetched {
        // Hosts that refuse a direct fetch (e.g. shallow clones) fall back
        // to importing an archive of the start commit.
        warn!(task = task_id.short(), error = %e, "fetch failed, importing archive");
        import_archive(host_repo, &clone, &start_ref)?;
        clone.git(&["checkout", "--quiet", "-b", &clone_branch(task_id)])?;
    }

    fsio::write_atomic(&paths.start_ref(), start_ref.as_bytes())?;
    fsio::write_atomic(&paths.task_id_file(), task_id.short().as_bytes())?;

    info!(task = task_id.short(), start_ref = %mvo_core::short(&start_ref, 8),
        branch = branch.as_deref().unwrap_or("(detached)"), "isolated clone ready");
    Ok(RepoSnapshot { start_ref, branch })
}

/// Merge task commits back into the host repository.
///
/// Never panics and never raises: unexpected git failures are folded into a
/// `reason: "error"` outcome. The caller serializes host-repo mutations.
pub fn merge_back(
    host_repo: &Path,
    paths: &TaskPaths,
    task_id: &TaskId,
    start_ref: &str,
    branch: Option<&str>,
) -> MergeOutcome {
    match merge_back_inner(host_repo, paths, task_id, start_ref, branch) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(task = task_id.short(), error = %e, "merge-back failed");
            let task_ref = task_ref_name(task_id);
            let preserved = git_try(host_repo, &["rev-parse", "--verify", "--quiet", &task_ref])
                .map(|_| task_ref);
            MergeOutcome::error(e.to_string(), preserved)
        }
    }
}

fn merge_back_inner(
    host_repo: &Path,
    paths: &TaskPaths,
    task_id: &TaskId,
    start_ref: &str,
    branch: Option<&str>,
) -> Result<MergeOutcome, GitError> {
    let clone_dir = paths.repo();
    let clone = CloneCtx { dir: clone_dir.clone(), config: paths.git_config() };

    // Commits the guest produced on top of the start ref. An archive-seeded
    // clone has no start_ref in its history; count everything it has.
    let commits = clone
        .git_try(&["rev-list", "--count", &format!("{start_ref}..HEAD")])
        .or_else(|| clone.git_try(&["rev-list", "--count", "HEAD"]))
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    if commits == 0 {
        return Ok(MergeOutcome::noop());
    }

    // Preservation ref first: whatever happens next, the commits survive.
    let task_ref = task_ref_name(task_id);
    git(
        host_repo,
        &[
            "fetch",
            "--no-tags",
            "--quiet",
            &clone_dir.display().to_string(),
            &format!("{}:{}", clone_branch(task_id), task_ref),
        ],
    )?;

    let Some(branch) = branch else {
        info!(task = task_id.short(), "host is on a detached HEAD, leaving task ref");
        return Ok(MergeOutcome::detached_head(task_ref, commits));
    };

    let head_now = current_ref(host_repo)?;
    if head_now == start_ref && current_branch(host_repo).as_deref() == Some(branch) {
        git(host_repo, &["merge", "--ff-only", "--quiet", &task_ref])?;
        info!(task = task_id.short(), branch, commits, "fast-forwarded host branch");
        return Ok(MergeOutcome::fast_forward(commits));
    }

    rebase_onto_branch(host_repo, task_id, &task_ref, branch, commits)
}

/// The host branch moved since the task started: rebase the task ref onto it
/// in a temporary worktree, then fast-forward the branch to the rebased head.
fn rebase_onto_branch(
    host_repo: &Path,
    task_id: &TaskId,
    task_ref: &str,
    branch: &str,
    commits: u64,
) -> Result<MergeOutcome, GitError> {
    let tmp = tempfile::Builder::new().prefix("task-rebase-").tempdir()?;
    let wt = tmp.path().join("wt");
    let wt_str = wt.display().to_string();
    git(host_repo, &["worktree", "add", "--quiet", "--detach", &wt_str, task_ref])?;

    let rebase = run_git(&wt, &["rebase", "--quiet", branch], &[])?;
    if !rebase.status.success() {
        let conflicts = git_try(&wt, &["diff", "--name-only", "--diff-filter=U"])
            .map(|s| s.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
            .unwrap_or_default();
        git_try(&wt, &["rebase", "--abort"]);
        remove_worktree(host_repo, &wt_str);
        info!(task = task_id.short(), branch, ?conflicts, "rebase hit conflicts, task ref preserved");
        return Ok(MergeOutcome::conflicts(conflicts, task_ref.to_string(), commits));
    }

    // Update the branch before dropping the worktree so the rebased commits
    // are never left unreferenced.
    let rebased = current_ref(&wt)?;
    let update = if current_branch(host_repo).as_deref() == Some(branch) {
        git(host_repo, &["merge", "--ff-only", "--quiet", &rebased])
    } else {
        // Host switched branches meanwhile; update the ref compare-and-swap.
        git(host_repo, &["rev-parse", &format!("refs/heads/{branch}")]).and_then(|old| {
            git(host_repo, &["update-ref", &format!("refs/heads/{branch}"), &rebased, &old])
        })
    };
    remove_worktree(host_repo, &wt_str);
    update?;
    info!(task = task_id.short(), branch, commits, "rebased task commits onto host branch");
    Ok(MergeOutcome::rebase(commits))
}

fn remove_worktree(host_repo: &Path, wt: &str) {
    git_try(host_repo, &["worktree", "remove", "--force", wt]);
    git_try(host_repo, &["worktree", "prune"]);
}

/// Delete `refs/tasks/<task_id>` on the host. Missing ref is success.
pub fn delete_task_ref(host_repo: &Path, task_id: &TaskId) -> Result<(), GitError> {
    let task_ref = task_ref_name(task_id);
    if git_try(host_repo, &["rev-parse", "--verify", "--quiet", &task_ref]).is_some() {
        git(host_repo, &["update-ref", "-d", &task_ref])?;
        info!(task = task_id.short(), "deleted task ref");
    }
    Ok(())
}

/// Per-clone git context: every command runs with the isolated global config.
struct CloneCtx {
    dir: PathBuf,
    config: PathBuf,
}

impl CloneCtx {
    fn git(&self, args: &[&str]) -> Result<String, GitError> {
        git_env(
            &self.dir,
            args,
            &[
                ("GIT_CONFIG_GLOBAL", self.config.as_os_str()),
                ("GIT_CONFIG_NOSYSTEM", OsStr::new("1")),
            ],
        )
    }

    fn git_try(&self, args: &[&str]) -> Option<String> {
        self.git(args).ok()
    }
}

fn write_isolated_config(paths: &TaskPaths, task_id: &TaskId) -> Result<(), GitError> {
    let config = format!(
        "[safe]\n\tdirectory = *\n[user]\n\tname = MicroVM Task {short}\n\temail = task-{id}@microvm.local\n",
        short = task_id.short(),
        id = task_id,
    );
    fsio::write_atomic(&paths.git_config(), config.as_bytes())?;
    Ok(())
}

/// Seed the clone from `git archive` when fetching is impossible.
fn import_archive(host_repo: &Path, clone: &CloneCtx, start_ref: &str) -> Result<(), GitError> {
    let archive = run_git(host_repo, &["archive", start_ref], &[])
        .ok()
        .filter(|o| o.status.success())
        .map(|o| o.stdout);
    let archive = match archive {
        Some(bytes) => bytes,
        // Shallow host where even the start ref cannot be archived.
        None => {
            let output = run_git(host_repo, &["archive", "HEAD"], &[])?;
            if !output.status.success() {
                return Err(GitError::Command {
                    args: "archive HEAD".into(),
                    dir: host_repo.to_path_buf(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            output.stdout
        }
    };

    let mut tar = Command::new("tar")
        .args(["-x"])
        .current_dir(&clone.dir)
        .stdin(Stdio::piped())
        .spawn()?;
    if let Some(mut stdin) = tar.stdin.take() {
        stdin.write_all(&archive)?;
    }
    let status = tar.wait()?;
    if !status.success() {
        return Err(GitError::Command {
            args: "tar -x".into(),
            dir: clone.dir.clone(),
            stderr: format!("tar exited with {status}"),
        });
    }

    clone.git(&["add", "-A"])?;
    clone.git(&[
        "commit",
        "--quiet",
        "-m",
        &format!("Seed from {}", mvo_core::short(start_ref, 8)),
    ])?;
    Ok(())
}

#[cfg(test)]
#[path = "git_tests.rs"]
mod tests;
