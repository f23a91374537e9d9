// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Task record and lifecycle state machine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::fsio;
use crate::id::TaskId;
use crate::paths::TaskPaths;

/// Status of a task.
///
/// The only legal progression is `pending → running → (completed | failed)`,
/// with `pending → failed` permitted for pre-start errors. Terminal states
/// never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The allowed state table.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task {id}: invalid transition from {from} to {to}")]
    InvalidTransition { id: TaskId, from: TaskStatus, to: TaskStatus },

    #[error("Failed to persist task state: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot of one task's state, serialized verbatim as `task.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub slot: u32,
    pub repo_alias: String,
    pub repo_path: PathBuf,
    /// Host branch at creation time; `None` on a detached HEAD.
    #[serde(default)]
    pub branch: Option<String>,
    /// Host commit captured at creation; the merge base for merge-back.
    #[serde(default)]
    pub start_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// PID of the VM runner process.
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Task {
    pub fn paths(&self) -> TaskPaths {
        TaskPaths::new(&self.repo_path, &self.id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Thread-safe handle around a [`Task`].
///
/// Every state transition validates against the allowed state table under an
/// internal lock and rewrites `task.json` atomically before returning, so an
/// external reader that observes a terminal status is reading the persisted
/// truth.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<Mutex<Task>>,
}

impl TaskHandle {
    /// Create a new `pending` task and persist its initial record.
    pub fn create(
        id: TaskId,
        description: impl Into<String>,
        slot: u32,
        repo_alias: impl Into<String>,
        repo_path: PathBuf,
    ) -> Result<Self, TaskError> {
        let task = Task {
            id,
            description: description.into(),
            status: TaskStatus::Pending,
            slot,
            repo_alias: repo_alias.into(),
            repo_path,
            branch: None,
            start_ref: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            pid: None,
            exit_code: None,
            error: None,
        };
        persist(&task)?;
        Ok(Self { inner: Arc::new(Mutex::new(task)) })
    }

    /// Load a task record from its directory. Pure: read JSON, reconstruct.
    pub fn load(task_dir: &Path) -> Result<Self, TaskError> {
        let task: Task = fsio::read_json_opt(&task_dir.join("task.json"))?.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no task.json in {}", task_dir.display()),
            )
        })?;
        Ok(Self { inner: Arc::new(Mutex::new(task)) })
    }

    pub fn id(&self) -> TaskId {
        self.inner.lock().id.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().status
    }

    pub fn slot(&self) -> u32 {
        self.inner.lock().slot
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.lock().is_terminal()
    }

    pub fn paths(&self) -> TaskPaths {
        self.inner.lock().paths()
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> Task {
        self.inner.lock().clone()
    }

    /// Record the start ref and branch captured on the host repo.
    pub fn set_start_ref(
        &self,
        start_ref: impl Into<String>,
        branch: Option<String>,
    ) -> Result<(), TaskError> {
        let mut task = self.inner.lock();
        task.start_ref = Some(start_ref.into());
        task.branch = branch;
        persist(&task)
    }

    /// Record the spawned VM runner's PID.
    pub fn set_pid(&self, pid: u32) -> Result<(), TaskError> {
        let mut task = self.inner.lock();
        task.pid = Some(pid);
        persist(&task)
    }

    /// `pending → running`. Sets `started_at`.
    pub fn mark_running(&self) -> Result<(), TaskError> {
        let mut task = self.inner.lock();
        check_transition(&task, TaskStatus::Running)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        persist(&task)
    }

    /// `running → completed`. Sets `completed_at` and the exit code.
    pub fn mark_completed(&self, exit_code: Option<i32>) -> Result<(), TaskError> {
        let mut task = self.inner.lock();
        check_transition(&task, TaskStatus::Completed)?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.exit_code = exit_code.or(task.exit_code);
        persist(&task)
    }

    /// `pending|running → failed`. Sets `completed_at` and the error.
    pub fn mark_failed(&self, error: &str, exit_code: Option<i32>) -> Result<(), TaskError> {
        let mut task = self.inner.lock();
        check_transition(&task, TaskStatus::Failed)?;
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        task.error = Some(error.to_string());
        task.exit_code = exit_code.or(task.exit_code);
        persist(&task)
    }

    /// Parse `result.json` if the guest wrote one. Malformed content is
    /// treated as absent; the caller synthesizes a failure result.
    pub fn read_result(&self) -> Option<serde_json::Value> {
        read_lenient(&self.paths().result_json())
    }

    /// Parse `merge-result.json` if the orchestrator wrote one.
    pub fn read_merge_result(&self) -> Option<serde_json::Value> {
        read_lenient(&self.paths().merge_result_json())
    }
}

fn check_transition(task: &Task, to: TaskStatus) -> Result<(), TaskError> {
    if !task.status.can_transition_to(to) {
        return Err(TaskError::InvalidTransition {
            id: task.id.clone(),
            from: task.status,
            to,
        });
    }
    Ok(())
}

fn persist(task: &Task) -> Result<(), TaskError> {
    fsio::write_json_atomic(&task.paths().task_json(), task)?;
    Ok(())
}

fn read_lenient(path: &Path) -> Option<serde_json::Value> {
    match fsio::read_json_opt(path) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring malformed JSON file");
            None
        }
    }
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
