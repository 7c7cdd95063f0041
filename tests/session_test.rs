//! Tests for the session supervisor lifecycle.

mod common;

use common::{RecordingPublisher, ScriptedGenerator, Step, reply, wait_for};
use llm_chess_arena::{
    ChessRules, ExhaustionPolicy, GameResult, LogCategory, Participants, RetryPolicy,
    RulesEngine, Session, SessionHandle, SessionSettings, TurnController,
};
use std::sync::Arc;
use std::time::Duration;

const BACK_RANK: &str = "6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1";

fn spawn_session(
    rules: ChessRules,
    generator: &Arc<ScriptedGenerator>,
    policy: RetryPolicy,
    settings: SessionSettings,
) -> (SessionHandle, RecordingPublisher) {
    let rules: Arc<dyn RulesEngine> = Arc::new(rules);
    let oracle = common::oracle(generator);
    let controller = TurnController::new(Arc::clone(&rules), oracle.clone(), policy);
    let publisher = RecordingPublisher::default();

    let (session, handle) = Session::new(rules, controller, oracle, settings, publisher.clone());
    tokio::spawn(session.run());
    (handle, publisher)
}

fn players() -> Participants {
    Participants::new("llama3".to_string(), "mistral".to_string())
}

fn messages(snapshot: &llm_chess_arena::SessionSnapshot) -> Vec<String> {
    snapshot.logs().iter().map(|e| e.message().clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_checkmate_recorded_and_stop_cancels_restart() {
    let generator = ScriptedGenerator::new([reply("Back rank.\nMOVE: Ra8#")]);
    let rules = ChessRules::from_fen(BACK_RANK).expect("valid fen");
    let (handle, publisher) =
        spawn_session(rules, &generator, RetryPolicy::default(), SessionSettings::default());

    handle.start(players()).expect("start");
    let snapshot = wait_for(&handle, |s| s.stats().total() == 1).await;

    assert_eq!(*snapshot.stats().white_wins(), 1);
    assert_eq!(*snapshot.stats().black_wins(), 0);
    assert_eq!(snapshot.stats().games().len(), 1);
    let record = snapshot.stats().games().latest().expect("game record");
    assert_eq!(*record.result(), GameResult::WhiteWin);
    assert_eq!(record.summary(), "White wins by checkmate");
    assert_eq!(record.white(), "llama3");
    assert!(messages(&snapshot).contains(&"White plays Ra8#".to_string()));
    assert!(messages(&snapshot).contains(&"Game over: White wins by checkmate".to_string()));
    assert!(*snapshot.running());

    // Inside the restart delay
    handle.stop().expect("stop");
    tokio::time::sleep(Duration::from_secs(30)).await;

    let after = handle.snapshot().await.expect("snapshot");
    assert!(!*after.running());
    assert_eq!(after.stats().total(), 1);
    assert_eq!(after.stats().games().len(), 1);
    assert_eq!(generator.calls(), 1);
    assert_eq!(
        after.logs().latest().map(|e| e.message().as_str()),
        Some("Game stopped by user")
    );
    assert!(!publisher.snapshots.lock().expect("lock").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_delay() {
    let generator = ScriptedGenerator::new([reply("MOVE: Ra8#"), Step::Hang]);
    let rules = ChessRules::from_fen(BACK_RANK).expect("valid fen");
    let (handle, _publisher) =
        spawn_session(rules, &generator, RetryPolicy::default(), SessionSettings::default());

    handle.start(players()).expect("start");
    wait_for(&handle, |s| s.stats().total() == 1).await;

    let restarted = wait_for(&handle, |s| s.pgn().is_empty() && generator.calls() == 2).await;
    assert!(*restarted.running());
    assert_eq!(restarted.stats().total(), 1);
    assert_eq!(messages(&restarted).first().map(String::as_str), Some("Game started"));
    assert_eq!(generator.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_start_ignored_while_running() {
    let generator = ScriptedGenerator::new([Step::Hang]);
    let (handle, _publisher) = spawn_session(
        ChessRules::new(),
        &generator,
        RetryPolicy::default(),
        SessionSettings::default(),
    );

    handle.start(players()).expect("start");
    handle
        .start(Participants::new("a".to_string(), "b".to_string()))
        .expect("second start");

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(*snapshot.running());
    assert_eq!(snapshot.participants().as_ref(), Some(&players()));
    let started = messages(&snapshot)
        .iter()
        .filter(|m| *m == "Game started")
        .count();
    assert_eq!(started, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_in_flight_ply() {
    let generator = ScriptedGenerator::new([Step::Delay(Duration::from_secs(2), "MOVE: e4".to_string())]);
    let rules = ChessRules::new();
    let start_fen = rules.initial_position().fen().clone();
    let (handle, _publisher) =
        spawn_session(rules, &generator, RetryPolicy::default(), SessionSettings::default());

    handle.start(players()).expect("start");
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.stop().expect("stop");
    tokio::time::sleep(Duration::from_secs(10)).await;

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert!(!*snapshot.running());
    assert_eq!(snapshot.fen(), &start_fen);
    assert!(snapshot.last_move().is_none());
    assert!(snapshot.logs().iter().all(|e| *e.category() != LogCategory::Move));
    assert_eq!(generator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_keeps_one_request_pending() {
    let generator = ScriptedGenerator::new([
        Step::Delay(Duration::from_secs(10), "MOVE: e4".to_string()),
        Step::Delay(Duration::from_secs(10), "MOVE: d4".to_string()),
    ]);
    let (handle, _publisher) = spawn_session(
        ChessRules::new(),
        &generator,
        RetryPolicy::default(),
        SessionSettings::default(),
    );

    handle.start(players()).expect("start");
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.stop().expect("stop");
    handle.start(players()).expect("restart");
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(generator.calls(), 2);
    assert_eq!(generator.peak_in_flight(), 1);

    let snapshot = wait_for(&handle, |s| s.last_move().is_some()).await;
    assert_eq!(snapshot.last_move().as_ref().map(|m| m.san().as_str()), Some("d4"));
    assert!(*snapshot.running());
}

#[tokio::test(start_paused = true)]
async fn test_failed_attempts_logged_within_cap() {
    let generator = ScriptedGenerator::new((0..10).map(|_| reply("MOVE: Ke2")));
    let settings = SessionSettings::new(Duration::from_millis(500), Duration::from_secs(5), 3, 3);
    let (handle, _publisher) =
        spawn_session(ChessRules::new(), &generator, RetryPolicy::default(), settings);

    handle.start(players()).expect("start");
    let snapshot = wait_for(&handle, |_| generator.calls() >= 6).await;

    assert_eq!(snapshot.logs().len(), 3);
    assert!(snapshot.logs().iter().all(|e| *e.category() == LogCategory::Error));
    let ids: Vec<u64> = snapshot.logs().iter().map(|e| *e.id()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert!(snapshot.attempt().is_some_and(|a| a > 3));
    assert!(*snapshot.running());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_turn_stops_session() {
    let generator = ScriptedGenerator::new([reply("I have no idea"), reply("still thinking")]);
    let policy = RetryPolicy::new(Some(2), Duration::from_millis(100), ExhaustionPolicy::Abandon);
    let (handle, _publisher) =
        spawn_session(ChessRules::new(), &generator, policy, SessionSettings::default());

    handle.start(players()).expect("start");
    let snapshot = wait_for(&handle, |s| !*s.running()).await;

    let last = snapshot.logs().latest().expect("log entry");
    assert_eq!(*last.category(), LogCategory::Error);
    assert!(last.message().starts_with("Turn abandoned after 2 attempts"));
    assert_eq!(snapshot.stats().total(), 0);
    assert_eq!(generator.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_random_fallback_logged() {
    let generator = ScriptedGenerator::new([reply("I have no idea"), Step::Hang]);
    let policy = RetryPolicy::new(Some(1), Duration::from_millis(100), ExhaustionPolicy::RandomMove);
    let (handle, _publisher) =
        spawn_session(ChessRules::new(), &generator, policy, SessionSettings::default());

    handle.start(players()).expect("start");
    let snapshot = wait_for(&handle, |s| s.last_move().is_some()).await;

    assert!(*snapshot.running());
    assert!(
        messages(&snapshot)
            .iter()
            .any(|m| m.starts_with("White fallback to random: "))
    );
}

#[tokio::test]
async fn test_agents_from_handle() {
    let generator = ScriptedGenerator::with_agents(&["llama3"]);
    let (handle, _publisher) = spawn_session(
        ChessRules::new(),
        &generator,
        RetryPolicy::default(),
        SessionSettings::default(),
    );

    assert_eq!(handle.list_agents().await, ["llama3"]);
}

#[test]
fn test_game_result_displays_snake_case() {
    assert_eq!(GameResult::WhiteWin.to_string(), "white_win");
    assert_eq!(GameResult::BlackWin.to_string(), "black_win");
    assert_eq!(GameResult::Draw.to_string(), "draw");
}
