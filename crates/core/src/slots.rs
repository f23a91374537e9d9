// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Slot manager: a bounded integer pool with repository affinity.
//!
//! Slots number `1..=max_slots` and back one VM at a time with persistent
//! storage (Nix store overlay, container cache). A repo prefers the slot it
//! used last so those caches stay warm; the affinity map is persisted, the
//! active set is rebuilt on restart by scanning task directories.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::fsio;
use crate::id::TaskId;

/// Default number of slots.
pub const DEFAULT_MAX_SLOTS: u32 = 10;

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("All {max_slots} slots are busy. Active tasks: {}", format_active(.active))]
    AllSlotsBusy { max_slots: u32, active: Vec<SlotAssignment> },

    #[error("Slot state I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_active(active: &[SlotAssignment]) -> String {
    let ids: Vec<&str> = active.iter().map(|a| a.task_id.as_str()).collect();
    ids.join(", ")
}

/// An active `(slot, task_id)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotAssignment {
    pub slot: u32,
    pub task_id: TaskId,
}

/// Observability snapshot of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub max_slots: u32,
    pub active: Vec<SlotAssignment>,
    pub available: Vec<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AffinityFile {
    repo_to_slot: HashMap<String, u32>,
}

#[derive(Default)]
struct SlotState {
    /// repo-path-hash → last used slot. Persisted.
    affinity: HashMap<String, u32>,
    /// slot → task currently occupying it. In-memory only.
    active: HashMap<u32, TaskId>,
}

/// Bounded slot pool with repo affinity.
pub struct SlotManager {
    max_slots: u32,
    assignments_path: PathBuf,
    state: Mutex<SlotState>,
}

impl SlotManager {
    pub fn new(max_slots: u32, assignments_path: PathBuf) -> Self {
        let affinity = match fsio::read_json_opt::<AffinityFile>(&assignments_path) {
            Ok(Some(file)) => file.repo_to_slot,
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(path = %assignments_path.display(), error = %e,
                    "failed to load slot assignments, starting empty");
                HashMap::new()
            }
        };
        Self {
            max_slots,
            assignments_path,
            state: Mutex::new(SlotState { affinity, active: HashMap::new() }),
        }
    }

    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    /// Acquire a slot for `task_id`, preferring the repo's previous slot.
    ///
    /// Preference order: the affine slot if free, then the lowest-numbered
    /// free slot (which becomes the new affinity). Fails with
    /// [`SlotError::AllSlotsBusy`] carrying the active assignments.
    pub fn acquire(&self, repo_path: &Path, task_id: &TaskId) -> Result<u32, SlotError> {
        let key = hash_path(repo_path);
        let mut state = self.state.lock();

        if let Some(&preferred) = state.affinity.get(&key) {
            if !state.active.contains_key(&preferred) {
                state.active.insert(preferred, task_id.clone());
                info!(task = task_id.short(), slot = preferred, repo = %repo_path.display(),
                    "acquired preferred slot");
                return Ok(preferred);
            }
        }

        for slot in 1..=self.max_slots {
            if !state.active.contains_key(&slot) {
                state.active.insert(slot, task_id.clone());
                state.affinity.insert(key, slot);
                self.persist(&state)?;
                info!(task = task_id.short(), slot, repo = %repo_path.display(),
                    "acquired slot (new affinity)");
                return Ok(slot);
            }
        }

        let mut active: Vec<SlotAssignment> = state
            .active
            .iter()
            .map(|(&slot, task_id)| SlotAssignment { slot, task_id: task_id.clone() })
            .collect();
        active.sort_by_key(|a| a.slot);
        warn!(task = task_id.short(), max_slots = self.max_slots, "all slots busy");
        Err(SlotError::AllSlotsBusy { max_slots: self.max_slots, active })
    }

    /// Release a slot after its task reaches a terminal state.
    ///
    /// Never modifies affinity, so the repo keeps its preference.
    pub fn release(&self, slot: u32) {
        let mut state = self.state.lock();
        match state.active.remove(&slot) {
            Some(task_id) => info!(task = task_id.short(), slot, "released slot"),
            None => warn!(slot, "release of unoccupied slot ignored"),
        }
    }

    /// Re-occupy a slot for a task found still running during restart
    /// recovery. Does not touch affinity.
    pub fn restore(&self, slot: u32, task_id: &TaskId) {
        let mut state = self.state.lock();
        if let Some(existing) = state.active.insert(slot, task_id.clone()) {
            warn!(slot, old = existing.short(), new = task_id.short(),
                "slot restore displaced an existing assignment");
        }
    }

    /// Which slot, if any, `task_id` currently occupies.
    pub fn slot_for_task(&self, task_id: &TaskId) -> Option<u32> {
        let state = self.state.lock();
        state.active.iter().find(|(_, t)| *t == task_id).map(|(&slot, _)| slot)
    }

    pub fn status(&self) -> SlotStatus {
        let state = self.state.lock();
        let mut active: Vec<SlotAssignment> = state
            .active
            .iter()
            .map(|(&slot, task_id)| SlotAssignment { slot, task_id: task_id.clone() })
            .collect();
        active.sort_by_key(|a| a.slot);
        let available =
            (1..=self.max_slots).filter(|s| !state.active.contains_key(s)).collect();
        SlotStatus { max_slots: self.max_slots, active, available }
    }

    fn persist(&self, state: &SlotState) -> std::io::Result<()> {
        let file = AffinityFile { repo_to_slot: state.affinity.clone() };
        fsio::write_json_atomic(&self.assignments_path, &file)
    }
}

/// Stable affinity key: truncated sha256 of the symlink-resolved path.
fn hash_path(repo_path: &Path) -> String {
    let canonical = repo_path
        .canonicalize()
        .unwrap_or_else(|_| repo_path.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

#[cfg(test)]
#[path = "slots_tests.rs"]
mod tests;
