//! LLM Chess Arena library - unattended self-play between language models
//!
//! Two agents play chess by free-text generation; the arena turns their
//! prose into legal moves and keeps the game moving.
//!
//! # Architecture
//!
//! - **Extractor**: raw model text + legal moves -> chosen move (pure)
//! - **Oracle**: builds the move prompt and performs one generation request
//! - **Turn controller**: per-ply retry state machine; never commits an illegal move
//! - **Session**: start/stop lifecycle, game-over handling, auto-restart, rolling logs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use llm_chess_arena::{ArenaConfig, LlmClient, OracleClient, Participants, RulesEngine, Session, TurnController};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ArenaConfig::default();
//! let rules: Arc<dyn RulesEngine> = Arc::new(config.rules()?);
//! let oracle = OracleClient::new(Arc::new(LlmClient::new(config.llm_config()?)), config.oracle_settings());
//! let controller = TurnController::new(Arc::clone(&rules), oracle.clone(), config.retry_policy());
//!
//! let (handle, _snapshots) = Session::spawn(rules, controller, oracle, config.session_settings());
//! handle.start(Participants::new("llama3".to_string(), "mistral".to_string()))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Private module declarations
mod config;
mod extractor;
mod llm_client;
mod oracle;
mod ring;
mod rules;
mod server;
mod session;
mod turn;

// Crate-level exports - Configuration
pub use config::{ArenaConfig, ConfigError, OracleSection, ServerSection, SessionSection, TurnSection};

// Crate-level exports - Move extraction
pub use extractor::{Extraction, ExtractionMethod, extract};

// Crate-level exports - LLM transport
pub use llm_client::{
    DEFAULT_OLLAMA_URL, LlmClient, LlmConfig, LlmError, LlmErrorKind, LlmProvider, Prompt,
    SamplingOptions, TextGenerator,
};

// Crate-level exports - Move oracle
pub use oracle::{MoveRequest, OracleClient, OracleError, OracleErrorKind, OracleSettings};

// Crate-level exports - Rolling buffers
pub use ring::RingBuffer;

// Crate-level exports - Rules engine
pub use rules::{
    ChessRules, EndReason, GameEnd, GameStatus, LastMove, Position, RulesEngine, RulesRejection,
    RulesRejectionKind, STANDARD_START_FEN, Side,
};

// Crate-level exports - Observer server
pub use server::{AppState, router, serve};

// Crate-level exports - Session supervisor
pub use session::{
    GameRecord, GameResult, LogCategory, LogEntry, Participants, Session, SessionError,
    SessionHandle, SessionSettings, SessionSnapshot, SessionStats, SnapshotPublisher,
};

// Crate-level exports - Turn controller
pub use turn::{
    AttemptOutcome, ExhaustionPolicy, MoveAttempt, PlyOutcome, RetryPolicy, TurnController,
    TurnEvent, TurnRequest,
};
