//! Per-ply state machine.
//!
//! ```text
//! AwaitingOracle -> Extracting -> Validating -> Committed
//!       ^               |             |
//!       +---- Retry <---+-------------+ -> Abandoned
//! ```
//!
//! Every failed attempt is reported as a [`MoveAttempt`] event before the
//! controller retries. A move is only committed after the rules engine
//! accepts it; on exhaustion the configured [`ExhaustionPolicy`] decides
//! between abandoning the ply and substituting a random legal move.

use crate::extractor::{Extraction, extract};
use crate::oracle::{MoveRequest, OracleClient, OracleError};
use crate::rules::{Position, RulesEngine, Side};
use derive_getters::Getters;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// What to do once a finite attempt budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Give up the ply and stop the session.
    #[default]
    Abandon,
    /// Play a uniformly random legal move.
    RandomMove,
}

/// Retry limits for a ply.
#[derive(Debug, Clone, Getters)]
pub struct RetryPolicy {
    /// Maximum attempts per ply; `None` retries for as long as the session runs.
    max_attempts: Option<u32>,
    /// Pause between attempts.
    retry_delay: Duration,
    /// Behaviour when `max_attempts` is exceeded.
    exhaustion: ExhaustionPolicy,
}

impl RetryPolicy {
    /// Creates a retry policy.
    pub fn new(max_attempts: Option<u32>, retry_delay: Duration, exhaustion: ExhaustionPolicy) -> Self {
        Self {
            max_attempts,
            retry_delay,
            exhaustion,
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(None, Duration::from_secs(1), ExhaustionPolicy::Abandon)
    }
}

/// Disposition of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptOutcome {
    /// Move accepted and played.
    Committed,
    /// Extracted move rejected by the rules engine.
    Invalid,
    /// No legal move recognised in the response.
    NoMatch,
    /// The oracle call failed.
    OracleFailure,
}

/// Record of one oracle round trip within a ply.
#[derive(Debug, Clone, PartialEq, Eq, Getters, Serialize)]
pub struct MoveAttempt {
    /// 1-based attempt number.
    attempt: u32,
    /// Raw response text, or the error description on oracle failure.
    raw: String,
    /// Move token extracted, if any.
    extracted: Option<String>,
    /// Reasoning text separated from the move.
    rationale: String,
    /// Disposition.
    outcome: AttemptOutcome,
    /// Failure detail.
    error: Option<String>,
}

/// Terminal result of a ply.
#[derive(Debug, Clone, PartialEq)]
pub enum PlyOutcome {
    /// A legal move was played.
    Committed {
        /// Position after the move.
        position: Position,
        /// Move token as played.
        mv: String,
        /// Model reasoning.
        rationale: String,
        /// Raw text of the successful response.
        raw: String,
        /// Attempt that produced the move.
        attempt: u32,
        /// True when the move was substituted at random after exhaustion.
        substituted: bool,
    },
    /// Retries exhausted; no move was played.
    Abandoned {
        /// Attempts made.
        attempts: u32,
        /// Why the last attempt failed.
        reason: String,
    },
    /// Observer went away before a terminal state was reached.
    Cancelled,
}

/// Messages emitted while a ply runs, in order.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A failed attempt.
    Attempt(MoveAttempt),
    /// The ply reached a terminal state.
    Finished(PlyOutcome),
}

/// Input for one ply.
#[derive(Debug, Clone, Getters, derive_new::new)]
pub struct TurnRequest {
    /// Agent playing this side.
    agent: String,
    /// Side to move.
    side: Side,
    /// Position before the move.
    position: Position,
}

/// Internal state of the ply machine.
enum TurnState {
    AwaitingOracle,
    Extracting { raw: String },
    Validating { raw: String, extraction: Extraction },
    Retry { reason: String },
}

/// Drives one ply from oracle request to commit or abandonment.
#[derive(Clone)]
pub struct TurnController {
    rules: Arc<dyn RulesEngine>,
    oracle: OracleClient,
    policy: RetryPolicy,
}

impl std::fmt::Debug for TurnController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnController")
            .field("oracle", &self.oracle)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TurnController {
    /// Creates a controller.
    #[instrument(skip(rules, oracle))]
    pub fn new(rules: Arc<dyn RulesEngine>, oracle: OracleClient, policy: RetryPolicy) -> Self {
        Self {
            rules,
            oracle,
            policy,
        }
    }

    /// Retry policy in force.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs the ply to a terminal state.
    ///
    /// Failed attempts are sent on `events` as they happen. When the
    /// receiving side has been dropped the ply stops at the next state
    /// boundary and returns [`PlyOutcome::Cancelled`] without committing.
    #[instrument(skip(self, request, events), fields(agent = %request.agent, side = %request.side, ply = request.position.ply_count()))]
    pub async fn play_turn(
        &self,
        request: &TurnRequest,
        events: &mpsc::UnboundedSender<TurnEvent>,
    ) -> PlyOutcome {
        let position = &request.position;
        let mut attempt = 1;
        let mut legal_moves = Vec::new();
        let mut state = TurnState::AwaitingOracle;

        loop {
            if events.is_closed() {
                debug!(attempt, "Turn observer gone, cancelling ply");
                return PlyOutcome::Cancelled;
            }

            state = match state {
                TurnState::AwaitingOracle => {
                    legal_moves = self.rules.legal_moves(position);
                    if legal_moves.is_empty() {
                        warn!("No legal moves available");
                        return PlyOutcome::Abandoned {
                            attempts: attempt,
                            reason: "no legal moves in position".to_string(),
                        };
                    }

                    let oracle_request = MoveRequest::new(
                        request.agent.clone(),
                        request.side,
                        position.fen().clone(),
                        self.rules.render(position),
                        position.pgn_tail(*self.oracle.settings().history_window()),
                        legal_moves.clone(),
                        attempt,
                    );

                    match self.oracle.request_move(&oracle_request).await {
                        Ok(raw) => TurnState::Extracting { raw },
                        Err(e) => self.report_oracle_failure(events, attempt, &e),
                    }
                }

                TurnState::Extracting { raw } => {
                    let extraction = extract(&raw, &legal_moves, attempt);
                    if extraction.is_no_match() {
                        let reason = match extraction.candidate() {
                            Some(candidate) => format!("'{candidate}' is not a legal move"),
                            None => "no move found in response".to_string(),
                        };
                        self.report(events, MoveAttempt {
                            attempt,
                            raw,
                            extracted: extraction.candidate().clone(),
                            rationale: extraction.rationale().clone(),
                            outcome: AttemptOutcome::NoMatch,
                            error: Some(reason.clone()),
                        });
                        TurnState::Retry { reason }
                    } else {
                        TurnState::Validating { raw, extraction }
                    }
                }

                TurnState::Validating { raw, extraction } => {
                    let Some(token) = extraction.chosen().clone() else {
                        return PlyOutcome::Abandoned {
                            attempts: attempt,
                            reason: "validation reached without a move".to_string(),
                        };
                    };

                    match self.rules.apply_move(position, &token) {
                        Ok(next) => {
                            if events.is_closed() {
                                debug!(%token, "Turn observer gone, discarding move");
                                return PlyOutcome::Cancelled;
                            }
                            info!(mv = %token, attempt, method = ?extraction.method(), "Move committed");
                            return PlyOutcome::Committed {
                                position: next,
                                mv: token,
                                rationale: extraction.rationale().clone(),
                                raw,
                                attempt,
                                substituted: false,
                            };
                        }
                        Err(rejection) => {
                            let reason = format!("'{}' rejected: {}", token, rejection.message);
                            self.report(events, MoveAttempt {
                                attempt,
                                raw,
                                extracted: Some(token),
                                rationale: extraction.rationale().clone(),
                                outcome: AttemptOutcome::Invalid,
                                error: Some(reason.clone()),
                            });
                            TurnState::Retry { reason }
                        }
                    }
                }

                TurnState::Retry { reason } => {
                    if self.policy.exhausted(attempt) {
                        return self.exhaust(position, &legal_moves, attempt, reason);
                    }

                    attempt += 1;
                    debug!(attempt, delay = ?self.policy.retry_delay, "Retrying ply");
                    tokio::time::sleep(self.policy.retry_delay).await;
                    TurnState::AwaitingOracle
                }
            };
        }
    }

    fn report_oracle_failure(
        &self,
        events: &mpsc::UnboundedSender<TurnEvent>,
        attempt: u32,
        error: &OracleError,
    ) -> TurnState {
        let reason = format!("{}: {}", error.kind, error.message);
        self.report(events, MoveAttempt {
            attempt,
            raw: format!("Error: {}", error.message),
            extracted: None,
            rationale: String::new(),
            outcome: AttemptOutcome::OracleFailure,
            error: Some(reason.clone()),
        });
        TurnState::Retry { reason }
    }

    fn report(&self, events: &mpsc::UnboundedSender<TurnEvent>, attempt: MoveAttempt) {
        warn!(attempt = attempt.attempt, outcome = %attempt.outcome, error = ?attempt.error, "Attempt failed");
        // A closed channel is picked up at the next state boundary.
        let _ = events.send(TurnEvent::Attempt(attempt));
    }

    /// Applies the exhaustion policy.
    #[instrument(skip(self, position, legal_moves))]
    fn exhaust(&self, position: &Position, legal_moves: &[String], attempts: u32, reason: String) -> PlyOutcome {
        if self.policy.exhaustion == ExhaustionPolicy::RandomMove {
            let pick = legal_moves.choose(&mut rand::thread_rng()).cloned();
            if let Some(token) = pick {
                match self.rules.apply_move(position, &token) {
                    Ok(next) => {
                        warn!(mv = %token, attempts, "Attempts exhausted, playing random move");
                        return PlyOutcome::Committed {
                            position: next,
                            mv: token,
                            rationale: String::new(),
                            raw: String::new(),
                            attempt: attempts,
                            substituted: true,
                        };
                    }
                    Err(e) => warn!(error = %e, "Random fallback rejected"),
                }
            }
        }

        warn!(attempts, %reason, "Attempts exhausted, abandoning ply");
        PlyOutcome::Abandoned { attempts, reason }
    }
}
