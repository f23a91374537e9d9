// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal-transition events.

use serde::{Deserialize, Serialize};

use crate::id::TaskId;

/// One-shot notification emitted when a task reaches a terminal state.
///
/// Serializes with a `{"type": "completed" | "failed", ...}` tag. Exactly one
/// event is produced per task; delivery is FIFO across all tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Completed {
        task_id: TaskId,
        /// The guest's `result.json` (synthesized when the guest wrote none).
        result: serde_json::Value,
        /// The orchestrator's `merge-result.json`.
        merge_result: serde_json::Value,
    },

    Failed {
        task_id: TaskId,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        merge_result: Option<serde_json::Value>,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEvent::Completed { task_id, .. } | TaskEvent::Failed { task_id, .. } => task_id,
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
