// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mvo_engine::OrchestratorConfig;
use tower::ServiceExt;

struct Fixture {
    router: Router,
    orchestrator: Arc<Orchestrator>,
    _state: tempfile::TempDir,
    _nix: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let state = tempfile::tempdir().unwrap();
    let nix = tempfile::tempdir().unwrap();
    let mut config = OrchestratorConfig::new(state.path().to_path_buf(), nix.path().to_path_buf());
    config.api_token = Some("test-token".into());
    let orchestrator = Orchestrator::new(config);
    let router = build_router(Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
        shutdown: CancellationToken::new(),
    }));
    Fixture { router, orchestrator, _state: state, _nix: nix }
}

async fn call(router: Router, path: &str, body: Value) -> Value {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK, "tool endpoints always answer 200");
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_endpoint_answers() {
    let f = fixture();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = f.router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn run_task_with_unknown_alias_returns_error_shape() {
    let f = fixture();
    let body =
        call(f.router, "/tools/run_task", json!({"description": "x", "repo": "ghost"})).await;
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("ghost"));
    assert!(body.get("task_id").is_none());
}

#[tokio::test]
async fn get_task_info_unknown_task_returns_error_shape() {
    let f = fixture();
    let body = call(f.router, "/tools/get_task_info", json!({"task_id": "nope"})).await;
    assert!(body["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn cleanup_unknown_task_returns_error_shape() {
    let f = fixture();
    let body = call(f.router, "/tools/cleanup_task", json!({"task_id": "nope"})).await;
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn list_slots_reports_pool_shape() {
    let f = fixture();
    let body = call(f.router, "/tools/list_slots", json!({})).await;
    assert_eq!(body["max_slots"], 10);
    assert_eq!(body["active"], json!([]));
    assert_eq!(body["available"].as_array().unwrap().len(), 10);
}

#[tokio::test]
async fn list_repos_reflects_registry() {
    let f = fixture();
    let repo = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(repo.path().join(".git")).unwrap();
    f.orchestrator.registry().allow(repo.path(), Some("demo")).unwrap();

    let body = call(f.router, "/tools/list_repos", json!({})).await;
    let repos = body["repos"].as_array().unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0]["alias"], "demo");
    assert!(repos[0]["path"].as_str().is_some());
    assert!(repos[0]["added"].as_str().is_some());
}

#[tokio::test]
async fn list_tasks_is_empty_initially() {
    let f = fixture();
    let body = call(f.router, "/tools/list_tasks", json!({})).await;
    assert_eq!(body["tasks"], json!([]));
}

#[tokio::test]
async fn wait_with_no_tasks_reports_idle() {
    let f = fixture();
    let body = call(f.router, "/tools/wait_next_event", json!({"timeout_ms": 10})).await;
    assert_eq!(body, json!({"no_running_tasks": true}));
}

#[tokio::test]
async fn wait_accepts_empty_body() {
    let f = fixture();
    let req = Request::builder()
        .method("POST")
        .uri("/tools/wait_next_event")
        .body(Body::empty())
        .unwrap();
    let resp = f.router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn wait_returns_queued_event_json() {
    let f = fixture();
    f.orchestrator.event_bus().emit(mvo_core::TaskEvent::Completed {
        task_id: mvo_core::TaskId::from_string("deadbeef"),
        result: json!({"success": true}),
        merge_result: json!({"merged": true, "method": "fast-forward", "commits": 1, "conflicts": []}),
    });

    let body = call(f.router, "/tools/wait_next_event", json!({"timeout_ms": 50})).await;
    assert_eq!(body["type"], "completed");
    assert_eq!(body["task_id"], "deadbeef");
    assert_eq!(body["merge_result"]["method"], "fast-forward");
}
