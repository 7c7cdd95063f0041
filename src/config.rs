//! Arena configuration loaded from TOML.
//!
//! ```toml
//! [oracle]
//! provider = "ollama"
//! base_url = "http://localhost:11434"
//! timeout_secs = 30
//!
//! [turn]
//! max_attempts = 5
//! exhaustion = "abandon"
//!
//! [session]
//! ply_delay_ms = 500
//! restart_delay_ms = 5000
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::llm_client::{DEFAULT_OLLAMA_URL, LlmConfig, LlmProvider};
use crate::oracle::OracleSettings;
use crate::rules::ChessRules;
use crate::session::SessionSettings;
use crate::turn::{ExhaustionPolicy, RetryPolicy};
use derive_getters::Getters;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Top-level arena configuration.
#[derive(Debug, Clone, Default, PartialEq, Getters, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    /// Text-generation backend and prompt tuning.
    oracle: OracleSection,
    /// Per-ply retry policy.
    turn: TurnSection,
    /// Session pacing and buffer sizes.
    session: SessionSection,
    /// Observer HTTP server.
    server: ServerSection,
}

/// `[oracle]` table.
#[derive(Debug, Clone, PartialEq, Getters, Serialize, Deserialize)]
pub struct OracleSection {
    #[serde(default = "default_provider")]
    provider: LlmProvider,
    #[serde(default = "default_base_url")]
    base_url: String,
    /// Models advertised for hosted providers.
    #[serde(default)]
    models: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    max_tokens: u32,
    #[serde(default = "default_base_temperature")]
    base_temperature: f32,
    #[serde(default = "default_retry_temperature")]
    retry_temperature: f32,
    /// Plies of history included in each prompt.
    #[serde(default = "default_history_window")]
    history_window: usize,
}

/// `[turn]` table.
#[derive(Debug, Clone, PartialEq, Getters, Serialize, Deserialize)]
pub struct TurnSection {
    /// Absent means retry until stopped.
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default = "default_retry_delay_ms")]
    retry_delay_ms: u64,
    #[serde(default)]
    exhaustion: ExhaustionPolicy,
}

/// `[session]` table.
#[derive(Debug, Clone, PartialEq, Getters, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_ply_delay_ms")]
    ply_delay_ms: u64,
    #[serde(default = "default_restart_delay_ms")]
    restart_delay_ms: u64,
    #[serde(default = "default_capacity")]
    log_capacity: usize,
    #[serde(default = "default_capacity")]
    history_capacity: usize,
    /// Draw the game after this many plies.
    #[serde(default)]
    max_plies: Option<usize>,
    /// Start every game from this FEN instead of the standard position.
    #[serde(default)]
    start_fen: Option<String>,
}

/// `[server]` table.
#[derive(Debug, Clone, PartialEq, Getters, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_provider() -> LlmProvider {
    LlmProvider::Ollama
}

fn default_base_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    256
}

fn default_base_temperature() -> f32 {
    0.1
}

fn default_retry_temperature() -> f32 {
    0.7
}

fn default_history_window() -> usize {
    20
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_ply_delay_ms() -> u64 {
    500
}

fn default_restart_delay_ms() -> u64 {
    5000
}

fn default_capacity() -> usize {
    50
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for OracleSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            models: Vec::new(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            base_temperature: default_base_temperature(),
            retry_temperature: default_retry_temperature(),
            history_window: default_history_window(),
        }
    }
}

impl Default for TurnSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            retry_delay_ms: default_retry_delay_ms(),
            exhaustion: ExhaustionPolicy::default(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ply_delay_ms: default_ply_delay_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            log_capacity: default_capacity(),
            history_capacity: default_capacity(),
            max_plies: None,
            start_fen: None,
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ArenaConfig {
    /// Loads configuration from TOML file.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        debug!("Loading config from file");
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("Failed to read config file: {}", e)))?;

        let config = Self::from_toml(&content)?;
        info!(provider = %config.oracle.provider, "Config loaded successfully");
        Ok(config)
    }

    /// Parses configuration from a TOML string.
    #[instrument(skip(content))]
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConfigError::new(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise returns defaults.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            info!("Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.oracle.timeout_secs == 0 {
            return Err(ConfigError::new("oracle.timeout_secs must be positive"));
        }
        if self.turn.max_attempts == Some(0) {
            return Err(ConfigError::new("turn.max_attempts must be at least 1"));
        }
        if self.turn.exhaustion == ExhaustionPolicy::RandomMove && self.turn.max_attempts.is_none() {
            return Err(ConfigError::new(
                "turn.exhaustion = \"random_move\" requires turn.max_attempts",
            ));
        }
        if self.session.log_capacity == 0 || self.session.history_capacity == 0 {
            return Err(ConfigError::new("session capacities must be positive"));
        }
        Ok(())
    }

    /// Overrides the server bind address.
    pub fn with_server(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.server.host = host;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    /// Oracle settings derived from `[oracle]`.
    pub fn oracle_settings(&self) -> OracleSettings {
        OracleSettings::new(
            Duration::from_secs(self.oracle.timeout_secs),
            self.oracle.history_window,
            self.oracle.base_temperature,
            self.oracle.retry_temperature,
            self.oracle.max_tokens,
        )
    }

    /// Retry policy derived from `[turn]`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.turn.max_attempts,
            Duration::from_millis(self.turn.retry_delay_ms),
            self.turn.exhaustion,
        )
    }

    /// Session settings derived from `[session]`.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings::new(
            Duration::from_millis(self.session.ply_delay_ms),
            Duration::from_millis(self.session.restart_delay_ms),
            self.session.log_capacity,
            self.session.history_capacity,
        )
    }

    /// Rules engine honouring `start_fen` and `max_plies`.
    #[instrument(skip(self))]
    pub fn rules(&self) -> Result<ChessRules, ConfigError> {
        let rules = match &self.session.start_fen {
            Some(fen) => ChessRules::from_fen(fen)
                .map_err(|e| ConfigError::new(format!("Invalid session.start_fen: {}", e.message)))?,
            None => ChessRules::new(),
        };
        Ok(rules.with_max_plies(self.session.max_plies))
    }

    /// Creates LLM configuration.
    /// Hosted providers require OPENAI_API_KEY or ANTHROPIC_API_KEY.
    #[instrument(skip(self), fields(provider = ?self.oracle.provider))]
    pub fn llm_config(&self) -> Result<LlmConfig, ConfigError> {
        let api_key = match self.oracle.provider {
            LlmProvider::Ollama => None,
            LlmProvider::OpenAI => Some(std::env::var("OPENAI_API_KEY").map_err(|_| {
                ConfigError::new("OPENAI_API_KEY environment variable not set")
            })?),
            LlmProvider::Anthropic => Some(std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
                ConfigError::new("ANTHROPIC_API_KEY environment variable not set")
            })?),
        };

        Ok(LlmConfig::new(
            self.oracle.provider,
            api_key,
            self.oracle.base_url.clone(),
            self.oracle.models.clone(),
        ))
    }
}

/// Configuration error.
#[derive(Debug, Clone, Display, Error)]
#[display("Config error: {} at {}:{}", message, file, line)]
pub struct ConfigError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl ConfigError {
    /// Creates a new configuration error.
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
