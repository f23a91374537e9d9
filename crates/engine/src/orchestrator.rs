// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Orchestrator: composes the registry, slot pool, git engine, VM
//! supervisors, and event bus behind the tool surface.
//!
//! One instance per process, built from an explicit [`OrchestratorConfig`]
//! and injected into the tool server. Lock order everywhere is
//! Registry → SlotManager → Task → EventBus, with a separate host-git mutex
//! serializing mutations of host repositories.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mvo_core::{
    assignments_path, fsio, registry_path, tasks_dir, RegistryError, RepoRegistry, SlotError,
    SlotManager, SlotStatus, Task, TaskError, TaskEvent, TaskHandle, TaskId, TaskStatus,
};

use crate::event_bus::{EventBus, WaitOutcome};
use crate::git::{self, GitError};
use crate::vm::{self, BuildSpec, Supervisor, VmError, STOP_DEADLINE};

/// Default `wait_next_event` timeout: 30 minutes.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 1_800_000;

/// Longest description shown by `list_tasks`.
const LIST_DESCRIPTION_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Slots(#[from] SlotError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task {0} is still running; wait for it to finish before cleanup")]
    TaskRunning(TaskId),

    #[error("No API token found. Set CLAUDE_CODE_OAUTH_TOKEN or ANTHROPIC_API_KEY")]
    NoApiToken,

    #[error("Log file not found: {0}")]
    LogMissing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Explicit construction-time configuration; nothing is ambient.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Host-wide state root (registry, affinity map, slot storage).
    pub state_dir: PathBuf,
    /// Directory holding the declarative VM builder (`default.nix`).
    pub nix_dir: PathBuf,
    /// Builder attribute to realize.
    pub package: String,
    pub max_slots: u32,
    /// API token override; when `None` the well-known environment
    /// variables are consulted per task.
    pub api_token: Option<String>,
}

impl OrchestratorConfig {
    pub fn new(state_dir: PathBuf, nix_dir: PathBuf) -> Self {
        Self {
            state_dir,
            nix_dir,
            package: "claude-microvm".to_string(),
            max_slots: mvo_core::DEFAULT_MAX_SLOTS,
            api_token: None,
        }
    }
}

/// Everything `get_task_info` reports about one task.
#[derive(Debug, Serialize)]
pub struct TaskInfo {
    #[serde(flatten)]
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_result: Option<Value>,
}

/// One row of `list_tasks`.
#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub description: String,
    pub repo: String,
}

/// One row of `list_repos`.
#[derive(Debug, Serialize)]
pub struct RepoListing {
    pub alias: String,
    pub path: PathBuf,
    pub added: chrono::DateTime<chrono::Utc>,
}

/// Reply from `wait_next_event`.
#[derive(Debug)]
pub enum WaitReply {
    Event(TaskEvent),
    Timeout,
    Cancelled,
    NoRunningTasks,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: RepoRegistry,
    slots: SlotManager,
    events: EventBus,
    tasks: Mutex<HashMap<TaskId, TaskHandle>>,
    supervisors: Mutex<HashMap<TaskId, Arc<Supervisor>>>,
    /// Serializes host-repo mutations; concurrent branch updates on the
    /// same repository are unsafe.
    host_git: Mutex<()>,
}

impl Orchestrator {
    /// Build the orchestrator and run restart recovery.
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        let registry = RepoRegistry::new(registry_path(&config.state_dir));
        let slots = SlotManager::new(config.max_slots, assignments_path(&config.state_dir));
        let orchestrator = Arc::new(Self {
            registry,
            slots,
            events: EventBus::new(),
            tasks: Mutex::new(HashMap::new()),
            supervisors: Mutex::new(HashMap::new()),
            host_git: Mutex::new(()),
            config,
        });
        orchestrator.recover();
        orchestrator
    }

    pub fn registry(&self) -> &RepoRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Start a task in a fresh microVM. Returns once the VM is spawned.
    pub async fn run_task(
        self: &Arc<Self>,
        description: String,
        repo: String,
    ) -> Result<TaskId, OrchestratorError> {
        // Fail on missing credentials before acquiring any resource.
        let token = self.api_token()?;
        let repo_path = self.registry.resolve(&repo)?;
        let task_id = TaskId::new();
        let slot = self.slots.acquire(&repo_path, &task_id)?;

        let handle = match TaskHandle::create(
            task_id.clone(),
            description.clone(),
            slot,
            repo.clone(),
            repo_path.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.slots.release(slot);
                return Err(e.into());
            }
        };
        self.tasks.lock().insert(task_id.clone(), handle.clone());
        info!(task = task_id.short(), repo, slot, "task created");

        match self.start_task(&handle, slot, &description, &token).await {
            Ok(()) => Ok(task_id),
            Err(e) => {
                self.fail_before_start(&handle, slot, &e);
                Err(e)
            }
        }
    }

    async fn start_task(
        self: &Arc<Self>,
        handle: &TaskHandle,
        slot: u32,
        description: &str,
        token: &str,
    ) -> Result<(), OrchestratorError> {
        let paths = handle.paths();
        let repo_path = handle.snapshot().repo_path;
        fsio::write_atomic(&paths.task_md(), description.as_bytes())?;

        // Clone setup only reads the host repo, so it is not serialized
        // against other tasks.
        let snapshot = {
            let host = repo_path.clone();
            let setup_paths = paths.clone();
            let id = handle.id();
            tokio::task::spawn_blocking(move || git::setup_isolated_repo(&host, &setup_paths, &id))
                .await
                .map_err(join_error)??
        };
        handle.set_start_ref(snapshot.start_ref, snapshot.branch)?;

        handle.mark_running()?;

        let supervisor = {
            let orch = Arc::clone(self);
            let id = handle.id();
            let spawn_paths = paths.clone();
            let token = token.to_string();
            tokio::task::spawn_blocking(move || orch.build_and_spawn(id, &repo_path, slot, &spawn_paths, &token))
                .await
                .map_err(join_error)??
        };
        handle.set_pid(supervisor.pid())?;
        self.supervisors.lock().insert(handle.id(), supervisor);
        Ok(())
    }

    /// Blocking half of task startup: realize the builder, hand off the
    /// credential, spawn the runner.
    fn build_and_spawn(
        self: Arc<Self>,
        task_id: TaskId,
        repo_path: &std::path::Path,
        slot: u32,
        paths: &mvo_core::TaskPaths,
        token: &str,
    ) -> Result<Arc<Supervisor>, OrchestratorError> {
        let dirs = vm::prepare_slot_dirs(&self.config.state_dir, slot)?;
        let runner = vm::build_vm(&BuildSpec {
            nix_dir: &self.config.nix_dir,
            package: &self.config.package,
            slot,
            paths,
            dirs: &dirs,
        })?;
        let env = vm::runner_env(repo_path, paths, slot, &dirs, &self.config.package);

        vm::write_api_key(paths, token)?;

        let exit_orch = Arc::clone(&self);
        let exit_id = task_id.clone();
        let supervisor = Supervisor::spawn(
            task_id,
            &runner,
            &self.config.nix_dir,
            env,
            &paths.serial_log(),
            move |code| exit_orch.on_vm_exit(exit_id, code),
        )?;
        Ok(Arc::new(supervisor))
    }

    /// A failure before the exit callback was armed: the slot is released,
    /// the task fails, and a synthesized result is written for inspectors.
    fn fail_before_start(&self, handle: &TaskHandle, slot: u32, err: &OrchestratorError) {
        let message = format!("Failed to start task: {err}");
        warn!(task = handle.id().short(), error = %err, "task failed before VM start");

        self.slots.release(slot);
        if let Err(e) = handle.mark_failed(&message, None) {
            error!(task = handle.id().short(), error = %e, "could not record pre-start failure");
        }
        let result = synthesized_result(&message);
        if let Err(e) = fsio::write_json_atomic(&handle.paths().result_json(), &result) {
            warn!(task = handle.id().short(), error = %e, "could not write synthesized result");
        }
        self.events.emit(TaskEvent::Failed {
            task_id: handle.id(),
            error: message,
            exit_code: None,
            result: Some(result),
            merge_result: None,
        });
    }

    /// Exit callback, invoked on the supervisor's waiter thread.
    ///
    /// Order matters: parse result, merge back, persist the merge result,
    /// persist the terminal status, release the slot, and only then emit the
    /// event, so any observer of the event finds `task.json` terminal.
    fn on_vm_exit(&self, task_id: TaskId, exit_code: i32) {
        let Some(handle) = self.tasks.lock().get(&task_id).cloned() else {
            warn!(task = task_id.short(), "exit callback for unknown task");
            return;
        };
        let snapshot = handle.snapshot();
        let paths = handle.paths();

        let result = handle
            .read_result()
            .unwrap_or_else(|| synthesized_result("guest produced no result.json"));
        let guest_success = result.get("success").and_then(Value::as_bool).unwrap_or(false);

        let merge = {
            let _host = self.host_git.lock();
            git::merge_back(
                &snapshot.repo_path,
                &paths,
                &task_id,
                snapshot.start_ref.as_deref().unwrap_or(""),
                snapshot.branch.as_deref(),
            )
        };
        let merge_value = serde_json::to_value(&merge).unwrap_or_else(|_| json!({"merged": false}));
        if let Err(e) = fsio::write_json_atomic(&paths.merge_result_json(), &merge_value) {
            warn!(task = task_id.short(), error = %e, "could not write merge result");
        }

        // A guest-reported failure still merges and still preserves the
        // ref, but the task is classified failed. A merge *error* (not a
        // conflict) also fails the task.
        let merge_errored = merge.failed_with_reason("error");
        let completed = guest_success && !merge_errored;
        let transition = if completed {
            handle.mark_completed(Some(exit_code))
        } else {
            let message = if !guest_success {
                result
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("guest reported failure (exit {exit_code})"))
            } else {
                merge.error.clone().unwrap_or_else(|| "merge-back failed".to_string())
            };
            handle.mark_failed(&message, Some(exit_code))
        };
        if let Err(e) = transition {
            error!(task = task_id.short(), error = %e, "terminal transition rejected");
        }

        self.slots.release(snapshot.slot);

        let event = if completed {
            TaskEvent::Completed { task_id: task_id.clone(), result, merge_result: merge_value }
        } else {
            TaskEvent::Failed {
                task_id: task_id.clone(),
                error: handle.snapshot().error.unwrap_or_else(|| "task failed".to_string()),
                exit_code: Some(exit_code),
                result: Some(result),
                merge_result: Some(merge_value),
            }
        };
        self.events.emit(event);
        self.supervisors.lock().remove(&task_id);
    }

    pub fn get_task_info(&self, task_id: &str) -> Result<TaskInfo, OrchestratorError> {
        let handle = self.find_task(task_id)?;
        Ok(TaskInfo {
            result: handle.read_result(),
            merge_result: handle.read_merge_result(),
            task: handle.snapshot(),
        })
    }

    /// Absolute path of the serial console log. Content is not streamed;
    /// the host agent tails the file itself.
    pub fn get_task_logs(&self, task_id: &str) -> Result<PathBuf, OrchestratorError> {
        let handle = self.find_task(task_id)?;
        let log = handle.paths().serial_log();
        if !log.exists() {
            return Err(OrchestratorError::LogMissing(log));
        }
        Ok(log)
    }

    /// Wait for the next terminal-transition event.
    ///
    /// Drains a queued event even when nothing is running; otherwise reports
    /// that no tasks are active instead of blocking pointlessly.
    pub async fn wait_next_event(&self, timeout_ms: u64, cancel: &CancellationToken) -> WaitReply {
        if self.supervisors.lock().is_empty() {
            return match self.events.try_next() {
                Some(event) => WaitReply::Event(event),
                None => WaitReply::NoRunningTasks,
            };
        }
        match self.events.wait_async(Duration::from_millis(timeout_ms), cancel).await {
            WaitOutcome::Event(event) => WaitReply::Event(event),
            WaitOutcome::Timeout => WaitReply::Timeout,
            WaitOutcome::Cancelled => WaitReply::Cancelled,
        }
    }

    /// Delete a task's directory and optionally its preservation ref.
    ///
    /// Refuses while the task is running. Idempotent on terminal tasks: the
    /// record stays in memory, so a second call succeeds with nothing to do.
    pub async fn cleanup_task(
        self: &Arc<Self>,
        task_id: &str,
        delete_ref: bool,
    ) -> Result<(), OrchestratorError> {
        let handle = self.find_task(task_id)?;
        if handle.status() == TaskStatus::Running {
            return Err(OrchestratorError::TaskRunning(handle.id()));
        }

        let orch = Arc::clone(self);
        let id = handle.id();
        tokio::task::spawn_blocking(move || -> Result<(), OrchestratorError> {
            let snapshot = handle.snapshot();
            match std::fs::remove_dir_all(handle.paths().dir()) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if delete_ref {
                let _host = orch.host_git.lock();
                git::delete_task_ref(&snapshot.repo_path, &id)?;
            }
            info!(task = id.short(), delete_ref, "cleaned up task");
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    pub fn list_repos(&self) -> Result<Vec<RepoListing>, OrchestratorError> {
        Ok(self
            .registry
            .list()?
            .into_iter()
            .map(|(alias, entry)| RepoListing { alias, path: entry.path, added: entry.added })
            .collect())
    }

    /// Every task directory across all registered repos.
    pub fn list_tasks(&self) -> Result<Vec<TaskSummary>, OrchestratorError> {
        let mut summaries = Vec::new();
        for (alias, entry) in self.registry.list()? {
            let dir = tasks_dir(&entry.path);
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for task_dir in entries.flatten() {
                let Ok(handle) = TaskHandle::load(&task_dir.path()) else { continue };
                let task = handle.snapshot();
                let mut description = task.description;
                if description.chars().count() > LIST_DESCRIPTION_LEN {
                    description = description.chars().take(LIST_DESCRIPTION_LEN).collect();
                    description.push_str("...");
                }
                summaries.push(TaskSummary {
                    task_id: task.id,
                    status: task.status,
                    description,
                    repo: alias.clone(),
                });
            }
        }
        Ok(summaries)
    }

    pub fn list_slots(&self) -> SlotStatus {
        self.slots.status()
    }

    /// Stop every running VM gracefully. Exit callbacks still run, so tasks
    /// settle into terminal states on the way down.
    pub fn shutdown(&self) {
        let supervisors: Vec<Arc<Supervisor>> =
            self.supervisors.lock().values().cloned().collect();
        if supervisors.is_empty() {
            return;
        }
        info!(count = supervisors.len(), "stopping running VMs");
        for supervisor in supervisors {
            supervisor.stop(STOP_DEADLINE);
        }
    }

    /// Restart recovery: rebuild the active slot set from non-terminal task
    /// records, and fail tasks whose VM died while the orchestrator was
    /// down.
    fn recover(&self) {
        let repos = match self.registry.list() {
            Ok(repos) => repos,
            Err(e) => {
                warn!(error = %e, "recovery skipped: could not read registry");
                return;
            }
        };
        for (_alias, entry) in repos {
            let dir = tasks_dir(&entry.path);
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for task_dir in entries.flatten() {
                let Ok(handle) = TaskHandle::load(&task_dir.path()) else { continue };
                let task = handle.snapshot();
                if task.is_terminal() {
                    continue;
                }
                let alive = task.pid.map(vm::pid_alive).unwrap_or(false);
                if alive {
                    // The VM outlived us; keep its slot occupied. Its exit
                    // can no longer be observed, so no callback is armed.
                    self.slots.restore(task.slot, &task.id);
                    self.tasks.lock().insert(task.id.clone(), handle);
                    warn!(task = task.id.short(), pid = ?task.pid, slot = task.slot,
                        "reattached task with live VM; exit will not be observed");
                } else {
                    let message = format!(
                        "orphaned: VM process {} exited while the orchestrator was down",
                        task.pid.map(|p| p.to_string()).unwrap_or_else(|| "(unknown)".into()),
                    );
                    if let Err(e) = handle.mark_failed(&message, None) {
                        error!(task = task.id.short(), error = %e, "could not fail orphaned task");
                        continue;
                    }
                    self.tasks.lock().insert(task.id.clone(), handle.clone());
                    self.events.emit(TaskEvent::Failed {
                        task_id: task.id.clone(),
                        error: message,
                        exit_code: None,
                        result: handle.read_result(),
                        merge_result: handle.read_merge_result(),
                    });
                    info!(task = task.id.short(), slot = task.slot, "recovered orphaned task");
                }
            }
        }
    }

    fn find_task(&self, task_id: &str) -> Result<TaskHandle, OrchestratorError> {
        let id = TaskId::from_string(task_id);
        if let Some(handle) = self.tasks.lock().get(&id).cloned() {
            return Ok(handle);
        }
        // Not in memory: look across registered repos on disk.
        for (_alias, entry) in self.registry.list()? {
            let dir = tasks_dir(&entry.path).join(task_id);
            if dir.join("task.json").exists() {
                let handle = TaskHandle::load(&dir)?;
                self.tasks.lock().insert(id, handle.clone());
                return Ok(handle);
            }
        }
        Err(OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    fn api_token(&self) -> Result<String, OrchestratorError> {
        if let Some(token) = &self.config.api_token {
            return Ok(token.clone());
        }
        for var in ["CLAUDE_CODE_OAUTH_TOKEN", "ANTHROPIC_API_KEY"] {
            if let Ok(token) = std::env::var(var) {
                if !token.is_empty() {
                    return Ok(token);
                }
            }
        }
        Err(OrchestratorError::NoApiToken)
    }
}

fn synthesized_result(error: &str) -> Value {
    json!({ "success": false, "error": error })
}

fn join_error(e: tokio::task::JoinError) -> OrchestratorError {
    OrchestratorError::Internal(format!("background task panicked: {e}"))
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
