//! Move oracle: one prompt in, one raw completion out.
//!
//! Builds the move prompt (board, FEN, recent history, legal moves), picks
//! sampling parameters for the attempt number and enforces the request
//! timeout. Retry policy lives in the turn controller.

use crate::llm_client::{LlmError, LlmErrorKind, Prompt, SamplingOptions, TextGenerator};
use crate::rules::Side;
use derive_getters::Getters;
use derive_more::{Display, Error};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Tunables for prompt construction and sampling.
#[derive(Debug, Clone, Getters)]
pub struct OracleSettings {
    timeout: Duration,
    history_window: usize,
    base_temperature: f32,
    retry_temperature: f32,
    max_tokens: u32,
}

impl OracleSettings {
    /// Creates oracle settings.
    pub fn new(
        timeout: Duration,
        history_window: usize,
        base_temperature: f32,
        retry_temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            timeout,
            history_window,
            base_temperature,
            retry_temperature,
            max_tokens,
        }
    }
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 20, 0.1, 0.7, 256)
    }
}

/// Everything the oracle needs to ask for one move.
#[derive(Debug, Clone, Getters, derive_new::new)]
pub struct MoveRequest {
    /// Agent (model) asked to move.
    agent: String,
    /// Side to move.
    side: Side,
    /// Current position in FEN.
    fen: String,
    /// Human-readable board grid.
    board: String,
    /// Recent history as PGN movetext, already windowed.
    history: String,
    /// Legal move tokens.
    legal_moves: Vec<String>,
    /// 1-based attempt number within the ply.
    attempt: u32,
}

/// Sends move requests to a [`TextGenerator`].
#[derive(Clone)]
pub struct OracleClient {
    generator: Arc<dyn TextGenerator>,
    settings: OracleSettings,
}

impl std::fmt::Debug for OracleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl OracleClient {
    /// Creates an oracle over `generator`.
    #[instrument(skip(generator))]
    pub fn new(generator: Arc<dyn TextGenerator>, settings: OracleSettings) -> Self {
        Self {
            generator,
            settings,
        }
    }

    /// Oracle settings.
    pub fn settings(&self) -> &OracleSettings {
        &self.settings
    }

    /// Lists agents, logging and swallowing failures.
    #[instrument(skip(self))]
    pub async fn list_agents(&self) -> Vec<String> {
        match self.generator.list_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                warn!(error = %e, "Failed to list agents");
                Vec::new()
            }
        }
    }

    /// Builds the prompt for a request.
    ///
    /// Attempts after the first restate the required output format.
    #[instrument(skip(self, request), fields(agent = %request.agent, attempt = request.attempt))]
    pub fn build_prompt(&self, request: &MoveRequest) -> Prompt {
        let system = format!(
            "You are a chess engine playing as {side}. \
             Think briefly if you like, then finish with a single final line of the form \
             `MOVE: <move>` where <move> is copied exactly from the list of legal moves in \
             Standard Algebraic Notation. Do not invent moves.",
            side = request.side,
        );

        let history = if request.history.is_empty() {
            "(no moves yet)".to_string()
        } else {
            request.history.clone()
        };

        let mut user = format!(
            "You are playing as {side}.\n\n\
             Board ({side} to move, uppercase = White):\n{board}\n\n\
             FEN: {fen}\n\
             Recent moves: {history}\n\n\
             VALID LEGAL MOVES (choose one): [{legal}]\n\n",
            side = request.side,
            board = request.board,
            fen = request.fen,
            legal = request.legal_moves.join(", "),
        );

        if request.attempt > 1 {
            user.push_str(&format!(
                "Your previous answer (attempt {previous}) could not be read as a legal move. \
                 Respond with exactly one line `MOVE: <move>` using a move from the list above \
                 and nothing else.\n",
                previous = request.attempt - 1,
            ));
        }
        user.push_str("MOVE:");

        Prompt::new(system, user)
    }

    /// Sampling options for an attempt; retries sample hotter to break loops.
    pub fn sampling(&self, attempt: u32) -> SamplingOptions {
        let temperature = if attempt > 1 {
            self.settings.retry_temperature
        } else {
            self.settings.base_temperature
        };
        SamplingOptions::new(temperature, self.settings.max_tokens)
    }

    /// Requests one move. Never retries.
    #[instrument(skip(self, request), fields(agent = %request.agent, side = %request.side, attempt = request.attempt))]
    pub async fn request_move(&self, request: &MoveRequest) -> Result<String, OracleError> {
        let prompt = self.build_prompt(request);
        let options = self.sampling(request.attempt);

        debug!(timeout = ?self.settings.timeout, "Sending move request");
        let generation = self.generator.generate(&request.agent, &prompt, &options);

        let text = match tokio::time::timeout(self.settings.timeout, generation).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(OracleError::from(e)),
            Err(_) => {
                return Err(OracleError::new(
                    OracleErrorKind::Timeout,
                    format!("No response within {:?}", self.settings.timeout),
                ));
            }
        };

        if text.trim().is_empty() {
            return Err(OracleError::new(
                OracleErrorKind::EmptyResponse,
                "Oracle returned empty text",
            ));
        }

        info!(length = text.len(), "Received move response");
        Ok(text)
    }
}

/// Failure category for a move request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OracleErrorKind {
    /// Request exceeded the oracle timeout.
    Timeout,
    /// Network failure or non-2xx response.
    Transport,
    /// Response contained no text.
    EmptyResponse,
}

impl From<LlmErrorKind> for OracleErrorKind {
    fn from(kind: LlmErrorKind) -> Self {
        match kind {
            LlmErrorKind::Timeout => OracleErrorKind::Timeout,
            LlmErrorKind::Transport => OracleErrorKind::Transport,
            LlmErrorKind::EmptyResponse => OracleErrorKind::EmptyResponse,
        }
    }
}

/// Move oracle error.
#[derive(Debug, Clone, Display, Error)]
#[display("Oracle error ({}): {} at {}:{}", kind, message, file, line)]
pub struct OracleError {
    /// Failure category.
    pub kind: OracleErrorKind,
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl OracleError {
    /// Creates a new oracle error.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(kind: OracleErrorKind, message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            kind,
            message: message.into(),
            line: loc.line(),
            file: loc.file(),
        }
    }
}

impl From<LlmError> for OracleError {
    #[track_caller]
    fn from(err: LlmError) -> Self {
        Self::new(err.kind.into(), err.message)
    }
}
