// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Filesystem layout for host-wide state and per-task directories.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::id::TaskId;

/// Directory under a registered repo that holds task state.
pub const TASKS_SUBDIR: &str = ".microvm/tasks";

#[derive(Debug, Error)]
pub enum PathsError {
    #[error("Could not determine state directory (HOME not set)")]
    NoStateDir,
}

/// Resolve the host-wide state directory:
/// `MICROVM_ORCHESTRATOR_STATE_DIR` > `~/.microvm-orchestrator`.
pub fn state_dir() -> Result<PathBuf, PathsError> {
    if let Ok(dir) = std::env::var("MICROVM_ORCHESTRATOR_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").map_err(|_| PathsError::NoStateDir)?;
    Ok(PathBuf::from(home).join(".microvm-orchestrator"))
}

/// Path of the repo allowlist file.
pub fn registry_path(state_dir: &Path) -> PathBuf {
    state_dir.join("allowed-repos.json")
}

/// Path of the persisted slot affinity map.
pub fn assignments_path(state_dir: &Path) -> PathBuf {
    state_dir.join("slot-assignments.json")
}

/// Persistent storage directory for a slot.
pub fn slot_dir(state_dir: &Path, slot: u32) -> PathBuf {
    state_dir.join("slots").join(slot.to_string())
}

/// The `.microvm/tasks` directory of a repo.
pub fn tasks_dir(repo_path: &Path) -> PathBuf {
    repo_path.join(TASKS_SUBDIR)
}

/// Well-known file locations inside one task directory.
///
/// The layout is the external contract shared with the in-guest runner:
/// the guest reads `task.md` and `.api-key` and writes `result.json` and
/// `claude-stream.jsonl`; everything else belongs to the orchestrator.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    dir: PathBuf,
}

impl TaskPaths {
    pub fn new(repo_path: &Path, task_id: &TaskId) -> Self {
        Self { dir: tasks_dir(repo_path).join(task_id.as_str()) }
    }

    /// For loading an existing task directory directly.
    pub fn from_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The isolated clone the guest works in.
    pub fn repo(&self) -> PathBuf {
        self.dir.join("repo")
    }

    pub fn task_json(&self) -> PathBuf {
        self.dir.join("task.json")
    }

    pub fn task_md(&self) -> PathBuf {
        self.dir.join("task.md")
    }

    pub fn start_ref(&self) -> PathBuf {
        self.dir.join("start-ref")
    }

    pub fn task_id_file(&self) -> PathBuf {
        self.dir.join("task-id")
    }

    pub fn serial_log(&self) -> PathBuf {
        self.dir.join("serial.log")
    }

    pub fn result_json(&self) -> PathBuf {
        self.dir.join("result.json")
    }

    pub fn merge_result_json(&self) -> PathBuf {
        self.dir.join("merge-result.json")
    }

    pub fn stream_log(&self) -> PathBuf {
        self.dir.join("claude-stream.jsonl")
    }

    /// Transient credential file. Written 0600 before boot; the guest
    /// contract requires the runner to delete it after reading.
    pub fn api_key(&self) -> PathBuf {
        self.dir.join(".api-key")
    }

    /// Per-task isolated git config (pointed at via `GIT_CONFIG_GLOBAL`).
    pub fn git_config(&self) -> PathBuf {
        self.dir.join("gitconfig")
    }

    /// Virtio socket path handed to the VM builder.
    pub fn socket(&self) -> PathBuf {
        self.dir.join("socket")
    }
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod tests;
