// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! mvo-daemon: HTTP tool server.
//!
//! Thin JSON-over-HTTP glue in front of the orchestrator: one `POST
//! /tools/<name>` endpoint per tool. Every response is 200 with either the
//! tool's success shape or `{"error": message}`; transport errors never
//! escape to the host agent. HTTP (rather than stdio) is required so a
//! long `wait_next_event` can be cancelled independently of other calls.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use mvo_core::SlotError;
use mvo_engine::{Orchestrator, OrchestratorError, WaitReply, DEFAULT_WAIT_TIMEOUT_MS};

/// Default bind address of the tool server.
pub const DEFAULT_BIND: &str = "127.0.0.1:8765";

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: std::io::Error },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared state for all tool handlers.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled on shutdown so in-flight waits return `{"cancelled": true}`.
    pub shutdown: CancellationToken,
}

#[derive(Deserialize)]
struct RunTaskRequest {
    description: String,
    repo: String,
}

#[derive(Deserialize)]
struct TaskRequest {
    task_id: String,
}

#[derive(Deserialize)]
struct CleanupRequest {
    task_id: String,
    #[serde(default)]
    delete_ref: bool,
}

#[derive(Deserialize, Default)]
struct WaitRequest {
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_WAIT_TIMEOUT_MS
}

/// Build the tool router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tools/run_task", post(run_task))
        .route("/tools/get_task_info", post(get_task_info))
        .route("/tools/get_task_logs", post(get_task_logs))
        .route("/tools/wait_next_event", post(wait_next_event))
        .route("/tools/cleanup_task", post(cleanup_task))
        .route("/tools/list_repos", post(list_repos))
        .route("/tools/list_tasks", post(list_tasks))
        .route("/tools/list_slots", post(list_slots))
        .with_state(state)
}

fn error_body(err: &OrchestratorError) -> Value {
    json!({ "error": err.to_string() })
}

fn ok_or_error<T: serde::Serialize>(result: Result<T, OrchestratorError>) -> Json<Value> {
    match result {
        Ok(value) => Json(serde_json::to_value(value).unwrap_or_else(|e| {
            json!({ "error": format!("serialization failed: {e}") })
        })),
        Err(err) => Json(error_body(&err)),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn run_task(State(state): State<Arc<AppState>>, Json(req): Json<RunTaskRequest>) -> Json<Value> {
    match state.orchestrator.run_task(req.description, req.repo).await {
        Ok(task_id) => Json(json!({ "task_id": task_id })),
        Err(err) => {
            // Slot exhaustion carries the active assignments so the host
            // agent can decide what to wait on or clean up.
            if let OrchestratorError::Slots(SlotError::AllSlotsBusy { active, .. }) = &err {
                return Json(json!({ "error": err.to_string(), "active": active }));
            }
            Json(error_body(&err))
        }
    }
}

async fn get_task_info(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskRequest>,
) -> Json<Value> {
    ok_or_error(state.orchestrator.get_task_info(&req.task_id))
}

async fn get_task_logs(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskRequest>,
) -> Json<Value> {
    match state.orchestrator.get_task_logs(&req.task_id) {
        Ok(path) => Json(json!({ "log_path": path })),
        Err(err) => Json(error_body(&err)),
    }
}

async fn wait_next_event(
    State(state): State<Arc<AppState>>,
    req: Option<Json<WaitRequest>>,
) -> Json<Value> {
    let Json(req) = req.unwrap_or_default();
    let reply = state.orchestrator.wait_next_event(req.timeout_ms, &state.shutdown).await;
    Json(match reply {
        WaitReply::Event(event) => {
            serde_json::to_value(&event).unwrap_or_else(|e| json!({ "error": e.to_string() }))
        }
        WaitReply::Timeout => json!({ "timeout": true }),
        WaitReply::Cancelled => json!({ "cancelled": true }),
        WaitReply::NoRunningTasks => json!({ "no_running_tasks": true }),
    })
}

async fn cleanup_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CleanupRequest>,
) -> Json<Value> {
    match state.orchestrator.cleanup_task(&req.task_id, req.delete_ref).await {
        Ok(()) => Json(json!({ "success": true })),
        Err(err) => Json(error_body(&err)),
    }
}

async fn list_repos(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.orchestrator.list_repos() {
        Ok(repos) => Json(json!({ "repos": repos })),
        Err(err) => Json(error_body(&err)),
    }
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.orchestrator.list_tasks() {
        Ok(tasks) => Json(json!({ "tasks": tasks })),
        Err(err) => Json(error_body(&err)),
    }
}

async fn list_slots(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.orchestrator.list_slots();
    Json(json!({
        "max_slots": status.max_slots,
        "active": status.active,
        "available": status.available,
    }))
}

/// Run the tool server in the foreground until interrupted.
///
/// On Ctrl-C the shutdown token is cancelled (waking blocked waits), the
/// listener drains, and running VMs are stopped gracefully.
pub async fn serve(orchestrator: Arc<Orchestrator>, addr: SocketAddr) -> Result<(), ServeError> {
    let shutdown = CancellationToken::new();
    let state =
        Arc::new(AppState { orchestrator: Arc::clone(&orchestrator), shutdown: shutdown.clone() });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    info!(%addr, "tool server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    orchestrator.shutdown();
    info!("tool server stopped");
    Ok(())
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
