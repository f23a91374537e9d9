// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;
use serde_json::json;

fn make_task(dir: &Path) -> TaskHandle {
    TaskHandle::create(TaskId::new(), "add a readme", 1, "demo", dir.to_path_buf()).unwrap()
}

#[test]
fn create_persists_pending_record() {
    let repo = tempfile::tempdir().unwrap();
    let task = make_task(repo.path());
    assert_eq!(task.status(), TaskStatus::Pending);

    let loaded = TaskHandle::load(task.paths().dir()).unwrap();
    let snap = loaded.snapshot();
    assert_eq!(snap.status, TaskStatus::Pending);
    assert_eq!(snap.description, "add a readme");
    assert_eq!(snap.slot, 1);
    assert_eq!(snap.repo_alias, "demo");
    assert!(snap.started_at.is_none());
    assert!(snap.completed_at.is_none());
}

#[test]
fn happy_path_transitions() {
    let repo = tempfile::tempdir().unwrap();
    let task = make_task(repo.path());

    task.mark_running().unwrap();
    assert_eq!(task.status(), TaskStatus::Running);
    assert!(task.snapshot().started_at.is_some());

    task.mark_completed(Some(0)).unwrap();
    assert_eq!(task.status(), TaskStatus::Completed);
    let snap = task.snapshot();
    assert!(snap.completed_at.is_some());
    assert_eq!(snap.exit_code, Some(0));
}

#[test]
fn pending_can_fail_directly() {
    let repo = tempfile::tempdir().unwrap();
    let task = make_task(repo.path());
    task.mark_failed("nix build failed", None).unwrap();
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(task.snapshot().error.as_deref(), Some("nix build failed"));
}

#[test]
fn pending_cannot_complete() {
    let repo = tempfile::tempdir().unwrap();
    let task = make_task(repo.path());
    let err = task.mark_completed(Some(0)).unwrap_err();
    assert!(matches!(
        err,
        TaskError::InvalidTransition { from: TaskStatus::Pending, to: TaskStatus::Completed, .. }
    ));
    assert_eq!(task.status(), TaskStatus::Pending);
}

#[test]
fn terminal_states_are_sticky() {
    let repo = tempfile::tempdir().unwrap();
    let task = make_task(repo.path());
    task.mark_running().unwrap();
    task.mark_failed("vm crashed", Some(137)).unwrap();

    assert!(task.mark_completed(Some(0)).is_err());
    assert!(task.mark_failed("again", None).is_err());
    assert!(task.mark_running().is_err());
    assert_eq!(task.status(), TaskStatus::Failed);
}

#[test]
fn failed_transition_does_not_touch_disk() {
    let repo = tempfile::tempdir().unwrap();
    let task = make_task(repo.path());
    task.mark_running().unwrap();
    task.mark_completed(Some(0)).unwrap();
    let before = std::fs::read_to_string(task.paths().task_json()).unwrap();

    let _ = task.mark_failed("too late", None);
    let after = std::fs::read_to_string(task.paths().task_json()).unwrap();
    assert_eq!(before, after);
}

#[test]
fn start_ref_and_pid_round_trip() {
    let repo = tempfile::tempdir().unwrap();
    let task = make_task(repo.path());
    task.set_start_ref("a".repeat(40), Some("main".to_string())).unwrap();
    task.set_pid(4242).unwrap();

    let loaded = TaskHandle::load(task.paths().dir()).unwrap().snapshot();
    assert_eq!(loaded.start_ref.as_deref(), Some("a".repeat(40).as_str()));
    assert_eq!(loaded.branch.as_deref(), Some("main"));
    assert_eq!(loaded.pid, Some(4242));
}

#[test]
fn status_serializes_as_lowercase_tokens() {
    assert_eq!(serde_json::to_value(TaskStatus::Pending).unwrap(), json!("pending"));
    assert_eq!(serde_json::to_value(TaskStatus::Running).unwrap(), json!("running"));
    assert_eq!(serde_json::to_value(TaskStatus::Completed).unwrap(), json!("completed"));
    assert_eq!(serde_json::to_value(TaskStatus::Failed).unwrap(), json!("failed"));
}

#[test]
fn read_result_tolerates_garbage() {
    let repo = tempfile::tempdir().unwrap();
    let task = make_task(repo.path());
    assert!(task.read_result().is_none());

    std::fs::write(task.paths().result_json(), b"{truncated").unwrap();
    assert!(task.read_result().is_none());

    std::fs::write(task.paths().result_json(), br#"{"success": true}"#).unwrap();
    assert_eq!(task.read_result().unwrap()["success"], json!(true));
}

fn arb_status() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Running),
        Just(TaskStatus::Completed),
        Just(TaskStatus::Failed),
    ]
}

proptest! {
    /// Applying any sequence of transition attempts never moves a task
    /// backwards: once terminal, the status is frozen forever.
    #[test]
    fn status_is_monotonic(seq in proptest::collection::vec(arb_status(), 1..12)) {
        let repo = tempfile::tempdir().unwrap();
        let task = make_task(repo.path());
        let mut terminal: Option<TaskStatus> = None;

        for to in seq {
            let _ = match to {
                TaskStatus::Running => task.mark_running(),
                TaskStatus::Completed => task.mark_completed(Some(0)),
                TaskStatus::Failed => task.mark_failed("x", None),
                TaskStatus::Pending => unreachable!(),
            };
            let now = task.status();
            if let Some(frozen) = terminal {
                prop_assert_eq!(now, frozen);
            } else if now.is_terminal() {
                terminal = Some(now);
            }
        }
    }
}
