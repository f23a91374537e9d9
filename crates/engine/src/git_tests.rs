// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::process::Command;

/// A throwaway host repository with one initial commit.
struct HostRepo {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

fn sh(dir: &Path, cmd: &str, args: &[&str]) {
    let status = Command::new(cmd)
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .status()
        .unwrap();
    assert!(status.success(), "{cmd} {args:?} failed in {}", dir.display());
}

fn git_out(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(output.status.success(), "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr));
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn host_repo() -> HostRepo {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().canonicalize().unwrap();
    sh(&path, "git", &["init", "--quiet", "-b", "main"]);
    sh(&path, "git", &["config", "user.name", "Host User"]);
    sh(&path, "git", &["config", "user.email", "host@example.com"]);
    std::fs::write(path.join("README.md"), "hello\n").unwrap();
    sh(&path, "git", &["add", "-A"]);
    sh(&path, "git", &["commit", "--quiet", "-m", "init"]);
    HostRepo { _dir: dir, path }
}

fn commit_file(repo: &Path, name: &str, content: &str, message: &str) {
    std::fs::write(repo.join(name), content).unwrap();
    sh(repo, "git", &["add", "-A"]);
    sh(repo, "git", &["commit", "--quiet", "-m", message]);
}

fn setup(host: &HostRepo) -> (TaskId, TaskPaths, RepoSnapshot) {
    let task_id = TaskId::new();
    let paths = TaskPaths::new(&host.path, &task_id);
    let snap = setup_isolated_repo(&host.path, &paths, &task_id).unwrap();
    (task_id, paths, snap)
}

#[test]
fn setup_captures_start_ref_and_branch() {
    let host = host_repo();
    let head = git_out(&host.path, &["rev-parse", "HEAD"]);

    let (task_id, paths, snap) = setup(&host);
    assert_eq!(snap.start_ref, head);
    assert_eq!(snap.branch.as_deref(), Some("main"));

    // Clone is checked out at the start ref on a task branch.
    assert_eq!(git_out(&paths.repo(), &["rev-parse", "HEAD"]), head);
    let branch = git_out(&paths.repo(), &["symbolic-ref", "--short", "HEAD"]);
    assert_eq!(branch, format!("task-{}", task_id.short()));

    // Marker files written alongside the clone.
    assert_eq!(std::fs::read_to_string(paths.start_ref()).unwrap(), head);
    assert_eq!(std::fs::read_to_string(paths.task_id_file()).unwrap(), task_id.short());
}

#[test]
fn setup_writes_isolated_git_config() {
    let host = host_repo();
    let (_task_id, paths, _snap) = setup(&host);
    let config = std::fs::read_to_string(paths.git_config()).unwrap();
    assert!(config.contains("directory = *"));
    assert!(config.contains("@microvm.local"));
}

#[test]
fn merge_back_with_no_commits_is_noop() {
    let host = host_repo();
    let (task_id, paths, snap) = setup(&host);

    let outcome = merge_back(&host.path, &paths, &task_id, &snap.start_ref, snap.branch.as_deref());
    assert!(outcome.merged);
    assert_eq!(outcome.method.as_deref(), Some("noop"));
    assert_eq!(outcome.commits, 0);
}

#[test]
fn merge_back_fast_forwards_unmoved_host() {
    let host = host_repo();
    let (task_id, paths, snap) = setup(&host);
    commit_file(&paths.repo(), "a.txt", "task output\n", "add a.txt");

    let outcome = merge_back(&host.path, &paths, &task_id, &snap.start_ref, snap.branch.as_deref());
    assert!(outcome.merged, "outcome: {outcome:?}");
    assert_eq!(outcome.method.as_deref(), Some("fast-forward"));
    assert_eq!(outcome.commits, 1);
    assert!(outcome.conflicts.is_empty());

    // Host branch now points at the task commit.
    assert!(host.path.join("a.txt").exists());
    let clone_head = git_out(&paths.repo(), &["rev-parse", "HEAD"]);
    assert_eq!(git_out(&host.path, &["rev-parse", "main"]), clone_head);
}

#[test]
fn merge_back_preserves_task_ref_after_fast_forward() {
    let host = host_repo();
    let (task_id, paths, snap) = setup(&host);
    commit_file(&paths.repo(), "a.txt", "x\n", "add a.txt");

    merge_back(&host.path, &paths, &task_id, &snap.start_ref, snap.branch.as_deref());
    git_out(&host.path, &["rev-parse", "--verify", &task_ref_name(&task_id)]);
}

#[test]
fn merge_back_rebases_onto_moved_host() {
    let host = host_repo();
    let (task_id, paths, snap) = setup(&host);
    commit_file(&paths.repo(), "task.txt", "from task\n", "task work");
    commit_file(&host.path, "host.txt", "from host\n", "host work");

    let outcome = merge_back(&host.path, &paths, &task_id, &snap.start_ref, snap.branch.as_deref());
    assert!(outcome.merged, "outcome: {outcome:?}");
    assert_eq!(outcome.method.as_deref(), Some("rebase"));
    assert_eq!(outcome.commits, 1);

    // Both changes present on the host branch.
    assert!(host.path.join("task.txt").exists());
    assert!(host.path.join("host.txt").exists());
}

#[test]
fn merge_back_reports_conflicts_and_keeps_ref() {
    let host = host_repo();
    let (task_id, paths, snap) = setup(&host);
    commit_file(&paths.repo(), "shared.txt", "task version\n", "task edit");
    commit_file(&host.path, "shared.txt", "host version\n", "host edit");

    let outcome = merge_back(&host.path, &paths, &task_id, &snap.start_ref, snap.branch.as_deref());
    assert!(!outcome.merged);
    assert_eq!(outcome.reason.as_deref(), Some("conflicts"));
    assert_eq!(outcome.conflicts, vec!["shared.txt".to_string()]);
    assert_eq!(outcome.task_ref.as_deref(), Some(task_ref_name(&task_id).as_str()));

    // The host tree is untouched and the commits remain reachable.
    assert_eq!(std::fs::read_to_string(host.path.join("shared.txt")).unwrap(), "host version\n");
    git_out(&host.path, &["show", &format!("{}:shared.txt", task_ref_name(&task_id))]);

    // No leftover rebase state or worktrees on the host.
    assert!(!host.path.join(".git/rebase-merge").exists());
    assert!(!host.path.join(".git/rebase-apply").exists());
}

#[test]
fn merge_back_on_detached_host_skips_branch_update() {
    let host = host_repo();
    let head = git_out(&host.path, &["rev-parse", "HEAD"]);
    sh(&host.path, "git", &["checkout", "--quiet", "--detach", &head]);

    let (task_id, paths, snap) = setup(&host);
    assert!(snap.branch.is_none());
    commit_file(&paths.repo(), "a.txt", "x\n", "add a.txt");

    let outcome = merge_back(&host.path, &paths, &task_id, &snap.start_ref, None);
    assert!(!outcome.merged);
    assert_eq!(outcome.reason.as_deref(), Some("detached-head"));
    // Commits still preserved under the task ref.
    git_out(&host.path, &["rev-parse", "--verify", &task_ref_name(&task_id)]);
    assert_eq!(git_out(&host.path, &["rev-parse", "HEAD"]), head);
}

#[test]
fn delete_task_ref_is_idempotent() {
    let host = host_repo();
    let (task_id, paths, snap) = setup(&host);
    commit_file(&paths.repo(), "a.txt", "x\n", "add a.txt");
    merge_back(&host.path, &paths, &task_id, &snap.start_ref, snap.branch.as_deref());

    delete_task_ref(&host.path, &task_id).unwrap();
    let gone = Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", &task_ref_name(&task_id)])
        .current_dir(&host.path)
        .status()
        .unwrap();
    assert!(!gone.success());

    // Deleting again is still success.
    delete_task_ref(&host.path, &task_id).unwrap();
}

#[test]
fn merge_back_error_outcome_on_missing_clone() {
    let host = host_repo();
    let task_id = TaskId::new();
    let paths = TaskPaths::new(&host.path, &task_id);
    // No setup_isolated_repo: the clone directory does not exist. The count
    // probe returns zero commits, which reads as a noop rather than a crash.
    let outcome = merge_back(&host.path, &paths, &task_id, "0000000000000000000000000000000000000000", Some("main"));
    assert!(outcome.merged);
    assert_eq!(outcome.method.as_deref(), Some("noop"));
}

#[test]
fn task_ref_uses_full_id() {
    let task_id = TaskId::from_string("0123456789abcdef0123456789abcdef");
    assert_eq!(task_ref_name(&task_id), "refs/tasks/0123456789abcdef0123456789abcdef");
}
