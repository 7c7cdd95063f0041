//! Tests for the HTTP observer routes.

mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use common::{ScriptedGenerator, Step};
use llm_chess_arena::{
    AppState, ChessRules, RetryPolicy, RulesEngine, Session, SessionSettings, TurnController,
    router,
};
use std::sync::Arc;
use tower::ServiceExt;

fn app(generator: &Arc<ScriptedGenerator>) -> (axum::Router, llm_chess_arena::SessionHandle) {
    let rules: Arc<dyn RulesEngine> = Arc::new(ChessRules::new());
    let oracle = common::oracle(generator);
    let controller = TurnController::new(Arc::clone(&rules), oracle.clone(), RetryPolicy::default());
    let (handle, snapshots) = Session::spawn(rules, controller, oracle, SessionSettings::default());
    (router(AppState::new(handle.clone(), snapshots)), handle)
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn test_state_route_returns_snapshot() {
    let generator = ScriptedGenerator::new([]);
    let (app, _handle) = app(&generator);

    let response = app
        .oneshot(Request::get("/api/state").body(Body::empty()).expect("request"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let state = json_body(response).await;
    assert_eq!(state["running"], false);
    assert_eq!(state["turn"], "White");
    assert_eq!(state["stats"]["white_wins"], 0);
    assert!(state["fen"].as_str().is_some_and(|f| f.starts_with("rnbqkbnr/")));
}

#[tokio::test]
async fn test_agents_route() {
    let generator = ScriptedGenerator::with_agents(&["llama3", "mistral"]);
    let (app, _handle) = app(&generator);

    let response = app
        .oneshot(Request::get("/api/agents").body(Body::empty()).expect("request"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, serde_json::json!(["llama3", "mistral"]));
}

#[tokio::test]
async fn test_start_and_stop_routes() {
    let generator = ScriptedGenerator::new([Step::Hang]);
    let (app, handle) = app(&generator);

    let start = Request::post("/api/start")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"white":"llama3","black":"mistral"}"#))
        .expect("request");
    let response = app.clone().oneshot(start).await.expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(*snapshot.running());

    let stop = Request::post("/api/stop").body(Body::empty()).expect("request");
    let response = app.oneshot(stop).await.expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(!*snapshot.running());
}

#[tokio::test]
async fn test_start_rejects_malformed_body() {
    let generator = ScriptedGenerator::new([]);
    let (app, _handle) = app(&generator);

    let start = Request::post("/api/start")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"white":"llama3"}"#))
        .expect("request");
    let response = app.oneshot(start).await.expect("response");

    assert!(response.status().is_client_error());
}
