//! Session supervisor for continuous self-play.
//!
//! A [`Session`] owns all mutable game state and runs as a single tokio
//! task. Observers talk to it through a cloneable [`SessionHandle`] and
//! receive immutable [`SessionSnapshot`]s through a [`SnapshotPublisher`].
//!
//! Lifecycle: `Idle -> Playing -> GameOver -> (restart delay) -> Playing ...`
//! until [`SessionHandle::stop`] returns it to idle. Each ply runs in its
//! own task; stopping drops the ply's event channel so any late result is
//! discarded instead of being applied.

use crate::oracle::OracleClient;
use crate::ring::RingBuffer;
use crate::rules::{GameEnd, GameStatus, LastMove, Position, RulesEngine, Side};
use crate::turn::{AttemptOutcome, MoveAttempt, PlyOutcome, TurnController, TurnEvent, TurnRequest};
use chrono::{DateTime, Local};
use derive_getters::Getters;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Timing and buffer sizes for a session.
#[derive(Debug, Clone, Getters)]
pub struct SessionSettings {
    /// Pause between committed plies.
    ply_delay: Duration,
    /// Pause between a game ending and the next one starting.
    restart_delay: Duration,
    /// Maximum log entries retained.
    log_capacity: usize,
    /// Maximum finished games retained.
    history_capacity: usize,
}

impl SessionSettings {
    /// Creates session settings.
    pub fn new(
        ply_delay: Duration,
        restart_delay: Duration,
        log_capacity: usize,
        history_capacity: usize,
    ) -> Self {
        Self {
            ply_delay,
            restart_delay,
            log_capacity,
            history_capacity,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(5), 50, 50)
    }
}

/// Which agent plays which side.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize, Deserialize, derive_new::new)]
pub struct Participants {
    /// Agent playing White.
    white: String,
    /// Agent playing Black.
    black: String,
}

impl Participants {
    /// Agent assigned to `side`.
    pub fn agent_for(&self, side: Side) -> &str {
        match side {
            Side::White => &self.white,
            Side::Black => &self.black,
        }
    }
}

/// Category of an observer log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogCategory {
    /// Lifecycle messages.
    Info,
    /// Committed moves.
    Move,
    /// Failed attempts and session failures.
    Error,
}

/// One entry in the observer log.
#[derive(Debug, Clone, PartialEq, Getters, Serialize)]
pub struct LogEntry {
    id: u64,
    timestamp: DateTime<Local>,
    category: LogCategory,
    message: String,
    detail: Option<serde_json::Value>,
}

/// Final result of a game from White's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GameResult {
    /// White won.
    WhiteWin,
    /// Black won.
    BlackWin,
    /// Drawn.
    Draw,
}

impl From<&GameEnd> for GameResult {
    fn from(end: &GameEnd) -> Self {
        match end.winner() {
            Some(Side::White) => GameResult::WhiteWin,
            Some(Side::Black) => GameResult::BlackWin,
            None => GameResult::Draw,
        }
    }
}

/// A finished game.
#[derive(Debug, Clone, PartialEq, Getters, Serialize)]
pub struct GameRecord {
    id: u64,
    result: GameResult,
    /// Human-readable result line.
    summary: String,
    /// Full movetext.
    pgn: String,
    white: String,
    black: String,
    completed_at: DateTime<Local>,
}

/// Cumulative results across games.
#[derive(Debug, Clone, PartialEq, Getters, Serialize)]
pub struct SessionStats {
    white_wins: u32,
    black_wins: u32,
    draws: u32,
    /// Most recent games, newest first when serialized.
    games: RingBuffer<GameRecord>,
}

impl SessionStats {
    fn new(history_capacity: usize) -> Self {
        Self {
            white_wins: 0,
            black_wins: 0,
            draws: 0,
            games: RingBuffer::new(history_capacity),
        }
    }

    /// Total games finished.
    pub fn total(&self) -> u32 {
        self.white_wins + self.black_wins + self.draws
    }

    fn record(&mut self, record: GameRecord) {
        match record.result {
            GameResult::WhiteWin => self.white_wins += 1,
            GameResult::BlackWin => self.black_wins += 1,
            GameResult::Draw => self.draws += 1,
        }
        self.games.push(record);
    }
}

/// Read-only view of the session pushed to observers.
#[derive(Debug, Clone, PartialEq, Getters, Serialize)]
pub struct SessionSnapshot {
    fen: String,
    pgn: String,
    /// Board grid as shown to the agents.
    board: String,
    running: bool,
    turn: Side,
    last_move: Option<LastMove>,
    stats: SessionStats,
    /// Newest first when serialized.
    logs: RingBuffer<LogEntry>,
    participants: Option<Participants>,
    /// Attempt number of the ply in flight.
    attempt: Option<u32>,
}

/// Receives a snapshot at every state change.
pub trait SnapshotPublisher: Send + 'static {
    /// Publishes `snapshot` to observers.
    fn publish(&mut self, snapshot: SessionSnapshot);
}

impl SnapshotPublisher for watch::Sender<SessionSnapshot> {
    fn publish(&mut self, snapshot: SessionSnapshot) {
        // send_replace keeps working with no receivers attached.
        self.send_replace(snapshot);
    }
}

/// Work scheduled after a pacing delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuation {
    NextPly,
    Restart,
}

/// At most one pending delayed continuation.
#[derive(Debug, Default)]
struct Scheduler {
    pending: Option<(Instant, Continuation)>,
}

impl Scheduler {
    fn schedule(&mut self, delay: Duration, continuation: Continuation) {
        debug!(?delay, ?continuation, "Scheduling continuation");
        self.pending = Some((Instant::now() + delay, continuation));
    }

    fn cancel(&mut self) {
        if let Some((_, continuation)) = self.pending.take() {
            debug!(?continuation, "Cancelled pending continuation");
        }
    }

    /// Resolves when the pending continuation is due; never resolves if none.
    async fn due(&self) -> Continuation {
        match self.pending {
            Some((deadline, continuation)) => {
                tokio::time::sleep_until(deadline).await;
                continuation
            }
            None => std::future::pending().await,
        }
    }
}

/// Commands accepted by the session task.
#[derive(Debug)]
enum SessionCommand {
    Start(Participants),
    Stop,
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Handle for controlling a running [`Session`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    oracle: OracleClient,
}

impl SessionHandle {
    /// Starts self-play. Ignored if a game is already running.
    #[instrument(skip(self))]
    pub fn start(&self, participants: Participants) -> Result<(), SessionError> {
        self.send(SessionCommand::Start(participants))
    }

    /// Stops self-play and cancels any pending continuation.
    #[instrument(skip(self))]
    pub fn stop(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Stop)
    }

    /// Current snapshot.
    #[instrument(skip(self))]
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Snapshot(tx))?;
        rx.await
            .map_err(|_| SessionError::new("Session dropped snapshot request"))
    }

    /// Agents available for assignment. Failures yield an empty list.
    #[instrument(skip(self))]
    pub async fn list_agents(&self) -> Vec<String> {
        self.oracle.list_agents().await
    }

    #[track_caller]
    fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::new("Session task is not running"))
    }
}

/// The ply currently in flight.
///
/// Dropping it aborts the controller task, so a pending oracle call never
/// outlives the ply that issued it.
struct InFlightTurn {
    events: mpsc::UnboundedReceiver<TurnEvent>,
    task: JoinHandle<()>,
    side: Side,
    attempt: u32,
}

impl Drop for InFlightTurn {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owner of all mutable session state.
pub struct Session {
    rules: Arc<dyn RulesEngine>,
    controller: Arc<TurnController>,
    settings: SessionSettings,
    publisher: Box<dyn SnapshotPublisher>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,

    running: bool,
    participants: Option<Participants>,
    position: Position,
    logs: RingBuffer<LogEntry>,
    stats: SessionStats,
    next_log_id: u64,
    next_game_id: u64,

    scheduler: Scheduler,
    turn: Option<InFlightTurn>,
}

impl Session {
    /// Creates an idle session and its handle.
    ///
    /// Call [`Session::run`] (usually via `tokio::spawn`) to process commands.
    #[instrument(skip_all)]
    pub fn new(
        rules: Arc<dyn RulesEngine>,
        controller: TurnController,
        oracle: OracleClient,
        settings: SessionSettings,
        publisher: impl SnapshotPublisher,
    ) -> (Self, SessionHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let position = rules.initial_position();
        info!("Creating session");

        let session = Self {
            logs: RingBuffer::new(settings.log_capacity),
            stats: SessionStats::new(settings.history_capacity),
            rules,
            controller: Arc::new(controller),
            settings,
            publisher: Box::new(publisher),
            commands: rx,
            running: false,
            participants: None,
            position,
            next_log_id: 1,
            next_game_id: 1,
            scheduler: Scheduler::default(),
            turn: None,
        };

        let handle = SessionHandle {
            commands: tx,
            oracle,
        };
        (session, handle)
    }

    /// Spawns a session whose snapshots go to a watch channel.
    #[instrument(skip_all)]
    pub fn spawn(
        rules: Arc<dyn RulesEngine>,
        controller: TurnController,
        oracle: OracleClient,
        settings: SessionSettings,
    ) -> (SessionHandle, watch::Receiver<SessionSnapshot>) {
        let idle = Self::idle_snapshot(rules.as_ref(), &settings);
        let (tx, rx) = watch::channel(idle);
        let (session, handle) = Self::new(rules, controller, oracle, settings, tx);
        tokio::spawn(session.run());
        (handle, rx)
    }

    fn idle_snapshot(rules: &dyn RulesEngine, settings: &SessionSettings) -> SessionSnapshot {
        let position = rules.initial_position();
        SessionSnapshot {
            fen: position.fen().clone(),
            pgn: String::new(),
            board: rules.render(&position),
            running: false,
            turn: position.side_to_move(),
            last_move: None,
            stats: SessionStats::new(settings.history_capacity),
            logs: RingBuffer::new(settings.log_capacity),
            participants: None,
            attempt: None,
        }
    }

    /// Processes commands, ply events and timers until every handle is dropped.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!("Session task started");
        self.publish();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = next_turn_event(&mut self.turn) => self.handle_turn_event(event),
                continuation = self.scheduler.due() => {
                    self.scheduler.pending = None;
                    self.handle_continuation(continuation);
                }
            }
        }

        info!("All session handles dropped, session task exiting");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start(participants) => self.start(participants),
            SessionCommand::Stop => self.stop(),
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    #[instrument(skip(self), fields(white = %participants.white, black = %participants.black))]
    fn start(&mut self, participants: Participants) {
        if self.running {
            debug!("Start ignored, session already running");
            return;
        }

        self.participants = Some(participants);
        self.running = true;
        self.begin_game();
    }

    #[instrument(skip(self))]
    fn stop(&mut self) {
        self.running = false;
        self.scheduler.cancel();
        if self.turn.take().is_some() {
            debug!("Discarding in-flight ply");
        }
        self.log(LogCategory::Info, "Game stopped by user", None);
        self.publish();
    }

    /// Resets the board and logs and starts the first ply.
    fn begin_game(&mut self) {
        self.logs.clear();
        self.position = self.rules.initial_position();

        let detail = self
            .participants
            .as_ref()
            .and_then(|p| serde_json::to_value(p).ok());
        self.log(LogCategory::Info, "Game started", detail);
        self.publish();
        self.begin_ply();
    }

    fn handle_continuation(&mut self, continuation: Continuation) {
        if !self.running {
            debug!(?continuation, "Ignoring continuation while stopped");
            return;
        }
        match continuation {
            Continuation::NextPly => self.begin_ply(),
            Continuation::Restart => {
                info!("Restarting with same participants");
                self.begin_game();
            }
        }
    }

    /// Checks for game end, otherwise launches the turn controller.
    #[instrument(skip(self), fields(ply = self.position.ply_count()))]
    fn begin_ply(&mut self) {
        if !self.running || self.turn.is_some() {
            return;
        }

        if let GameStatus::Over(end) = self.rules.status(&self.position) {
            self.game_over(end);
            return;
        }

        let side = self.position.side_to_move();
        let Some(agent) = self.participants.as_ref().map(|p| p.agent_for(side).to_string()) else {
            error!("Running without participants");
            self.abandon("no participants configured".to_string());
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Arc::clone(&self.controller);
        let request = TurnRequest::new(agent, side, self.position.clone());

        debug!(%side, "Launching turn");
        let task = tokio::spawn(async move {
            let outcome = controller.play_turn(&request, &tx).await;
            let _ = tx.send(TurnEvent::Finished(outcome));
        });

        self.turn = Some(InFlightTurn {
            events: rx,
            task,
            side,
            attempt: 1,
        });
    }

    fn handle_turn_event(&mut self, event: Option<TurnEvent>) {
        match event {
            Some(TurnEvent::Attempt(attempt)) => self.record_failed_attempt(attempt),
            Some(TurnEvent::Finished(outcome)) => {
                self.turn = None;
                self.finish_ply(outcome);
            }
            None => {
                warn!("Turn task ended without an outcome");
                self.turn = None;
            }
        }
    }

    fn record_failed_attempt(&mut self, attempt: MoveAttempt) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.attempt = attempt.attempt() + 1;
        let side = turn.side;

        let what = match attempt.outcome() {
            AttemptOutcome::OracleFailure => "failed to generate a move",
            AttemptOutcome::NoMatch => "gave no recognisable move",
            AttemptOutcome::Invalid => "proposed an invalid move",
            AttemptOutcome::Committed => "committed",
        };
        let message = match attempt.extracted() {
            Some(token) => format!("{side} {what}: {token}"),
            None => format!("{side} {what}"),
        };

        let detail = serde_json::to_value(&attempt).ok();
        self.log(LogCategory::Error, message, detail);
        self.publish();
    }

    #[instrument(skip(self, outcome))]
    fn finish_ply(&mut self, outcome: PlyOutcome) {
        if !self.running {
            debug!("Discarding ply outcome after stop");
            return;
        }

        match outcome {
            PlyOutcome::Committed {
                position,
                mv,
                rationale,
                raw,
                attempt,
                substituted,
            } => {
                let side = self.position.side_to_move();
                let agent = self
                    .participants
                    .as_ref()
                    .map(|p| p.agent_for(side).to_string())
                    .unwrap_or_default();
                self.position = position;

                if substituted {
                    self.log(
                        LogCategory::Info,
                        format!("{side} fallback to random: {mv}"),
                        Some(serde_json::json!({ "agent": agent, "attempts": attempt })),
                    );
                } else {
                    let detail = serde_json::json!({
                        "raw": raw,
                        "rationale": rationale,
                        "agent": agent,
                        "attempt": attempt,
                        "fen": self.position.fen(),
                    });
                    self.log(LogCategory::Move, format!("{side} plays {mv}"), Some(detail));
                }
                self.publish();

                match self.rules.status(&self.position) {
                    GameStatus::Over(end) => self.game_over(end),
                    GameStatus::Ongoing => {
                        self.scheduler.schedule(self.settings.ply_delay, Continuation::NextPly)
                    }
                }
            }
            PlyOutcome::Abandoned { attempts, reason } => {
                self.abandon(format!("Turn abandoned after {attempts} attempts: {reason}"));
            }
            PlyOutcome::Cancelled => debug!("Ply cancelled"),
        }
    }

    /// Unrecoverable failure: log, stop, publish.
    fn abandon(&mut self, message: String) {
        error!(%message, "Stopping session");
        self.running = false;
        self.scheduler.cancel();
        self.turn = None;
        self.log(LogCategory::Error, message, None);
        self.publish();
    }

    #[instrument(skip(self), fields(result = %end.summary()))]
    fn game_over(&mut self, end: GameEnd) {
        let summary = end.summary();
        let (white, black) = self
            .participants
            .as_ref()
            .map(|p| (p.white.clone(), p.black.clone()))
            .unwrap_or_default();

        let record = GameRecord {
            id: self.next_game_id,
            result: GameResult::from(&end),
            summary: summary.clone(),
            pgn: self.position.pgn(),
            white,
            black,
            completed_at: Local::now(),
        };
        self.next_game_id += 1;
        self.stats.record(record);

        info!(total = self.stats.total(), "Game recorded");
        self.log(LogCategory::Info, format!("Game over: {summary}"), None);
        self.publish();

        if self.running {
            self.scheduler
                .schedule(self.settings.restart_delay, Continuation::Restart);
        }
    }

    fn log(
        &mut self,
        category: LogCategory,
        message: impl Into<String>,
        detail: Option<serde_json::Value>,
    ) {
        let message = message.into();
        match category {
            LogCategory::Error => warn!(%category, %message, "Session log"),
            _ => info!(%category, %message, "Session log"),
        }

        self.logs.push(LogEntry {
            id: self.next_log_id,
            timestamp: Local::now(),
            category,
            message,
            detail,
        });
        self.next_log_id += 1;
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            fen: self.position.fen().clone(),
            pgn: self.position.pgn(),
            board: self.rules.render(&self.position),
            running: self.running,
            turn: self.position.side_to_move(),
            last_move: self.position.last_move().clone(),
            stats: self.stats.clone(),
            logs: self.logs.clone(),
            participants: self.participants.clone(),
            attempt: self.turn.as_ref().map(|t| t.attempt),
        }
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        self.publisher.publish(snapshot);
    }
}

/// Next event from the ply in flight; pends forever when idle.
async fn next_turn_event(turn: &mut Option<InFlightTurn>) -> Option<TurnEvent> {
    match turn {
        Some(turn) => turn.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Session control error.
#[derive(Debug, Clone, Display, Error)]
#[display("Session error: {} at {}:{}", message, file, line)]
pub struct SessionError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl SessionError {
    /// Creates a new session error.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}
