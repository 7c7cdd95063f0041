//! Tests for prompt construction and single-shot move requests.

mod common;

use common::{ScriptedGenerator, Step, reply};
use llm_chess_arena::{
    ChessRules, LlmErrorKind, MoveRequest, OracleClient, OracleErrorKind, OracleSettings,
    RulesEngine, Side,
};
use std::time::Duration;

fn opening_request(attempt: u32) -> MoveRequest {
    let rules = ChessRules::new();
    let position = rules.initial_position();
    MoveRequest::new(
        "llama3".to_string(),
        Side::White,
        position.fen().clone(),
        rules.render(&position),
        position.pgn(),
        rules.legal_moves(&position),
        attempt,
    )
}

#[test]
fn test_prompt_lists_legal_moves() {
    let generator = ScriptedGenerator::new([]);
    let oracle = common::oracle(&generator);

    let prompt = oracle.build_prompt(&opening_request(1));

    assert!(prompt.system().contains("MOVE: <move>"));
    assert!(prompt.user().contains("You are playing as White"));
    assert!(prompt.user().contains("VALID LEGAL MOVES (choose one): ["));
    assert!(prompt.user().contains("Nf3"));
    assert!(prompt.user().contains("(no moves yet)"));
    assert!(prompt.user().ends_with("MOVE:"));
    assert!(!prompt.user().contains("previous answer"));
}

#[test]
fn test_retry_prompt_escalates() {
    let generator = ScriptedGenerator::new([]);
    let oracle = common::oracle(&generator);

    let prompt = oracle.build_prompt(&opening_request(3));

    assert!(prompt.user().contains("previous answer (attempt 2)"));
    assert!(prompt.user().ends_with("MOVE:"));
}

#[test]
fn test_retries_sample_hotter() {
    let generator = ScriptedGenerator::new([]);
    let oracle = common::oracle(&generator);

    assert_eq!(*oracle.sampling(1).temperature(), 0.1);
    assert_eq!(*oracle.sampling(2).temperature(), 0.7);
    assert_eq!(*oracle.sampling(2).max_tokens(), 256);
}

#[tokio::test]
async fn test_request_returns_raw_text() {
    let generator = ScriptedGenerator::new([reply("Central control.\nMOVE: e4")]);
    let oracle = common::oracle(&generator);

    let raw = oracle.request_move(&opening_request(1)).await.expect("reply");

    assert_eq!(raw, "Central control.\nMOVE: e4");
    let requests = generator.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, "llama3");
    assert_eq!(*requests[0].2.temperature(), 0.1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_classified() {
    let generator = ScriptedGenerator::new([Step::Hang]);
    let settings = OracleSettings::new(Duration::from_secs(2), 20, 0.1, 0.7, 256);
    let oracle = OracleClient::new(generator.clone(), settings);

    let err = oracle
        .request_move(&opening_request(1))
        .await
        .expect_err("should time out");

    assert_eq!(err.kind, OracleErrorKind::Timeout);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_empty_response_classified() {
    let generator = ScriptedGenerator::new([reply("  \n ")]);
    let oracle = common::oracle(&generator);

    let err = oracle
        .request_move(&opening_request(1))
        .await
        .expect_err("blank text");

    assert_eq!(err.kind, OracleErrorKind::EmptyResponse);
}

#[tokio::test]
async fn test_transport_error_passes_through() {
    let generator = ScriptedGenerator::new([Step::Fail(LlmErrorKind::Transport)]);
    let oracle = common::oracle(&generator);

    let err = oracle
        .request_move(&opening_request(1))
        .await
        .expect_err("transport failure");

    assert_eq!(err.kind, OracleErrorKind::Transport);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_agent_listing_failure_is_empty() {
    let failing = common::oracle(&ScriptedGenerator::new([]));
    assert!(failing.list_agents().await.is_empty());

    let listing = common::oracle(&ScriptedGenerator::with_agents(&["llama3", "mistral"]));
    assert_eq!(listing.list_agents().await, ["llama3", "mistral"]);
}
