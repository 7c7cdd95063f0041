//! Text-generation transport for Ollama, OpenAI and Anthropic.
//!
//! Agents are identified by model name. [`TextGenerator`] is the narrow
//! capability the move oracle consumes, so tests can swap in scripted
//! generators.

use async_openai::{
    Client as OpenAIClient,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use derive_getters::Getters;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

/// Default local Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// LLM provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LlmProvider {
    /// Local Ollama server (any pulled model).
    Ollama,
    /// OpenAI (GPT models).
    OpenAI,
    /// Anthropic (Claude models).
    Anthropic,
}

/// A prompt split into system instructions and user content.
#[derive(Debug, Clone, PartialEq, Eq, Getters, derive_new::new)]
pub struct Prompt {
    system: String,
    user: String,
}

/// Per-request sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Getters, derive_new::new)]
pub struct SamplingOptions {
    temperature: f32,
    max_tokens: u32,
}

/// Configuration for LLM client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    provider: LlmProvider,
    api_key: Option<String>,
    base_url: String,
    models: Vec<String>,
}

impl LlmConfig {
    /// Creates a new LLM configuration.
    ///
    /// `models` are the agents advertised for hosted providers, which have
    /// no cheap listing endpoint.
    #[instrument(skip(api_key), fields(provider = ?provider, base_url = %base_url))]
    pub fn new(
        provider: LlmProvider,
        api_key: Option<String>,
        base_url: String,
        models: Vec<String>,
    ) -> Self {
        debug!("Creating LLM config");
        Self {
            provider,
            api_key,
            base_url,
            models,
        }
    }

    /// Gets the provider.
    #[instrument(skip(self))]
    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    /// Gets the API key.
    #[instrument(skip(self))]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Gets the base URL.
    #[instrument(skip(self))]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Gets the advertised models.
    #[instrument(skip(self))]
    pub fn models(&self) -> &[String] {
        &self.models
    }
}

/// Capability consumed from the text-generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Agents that can be assigned to a side.
    async fn list_agents(&self) -> Result<Vec<String>, LlmError>;

    /// Generates a completion for `prompt` using agent `agent`.
    ///
    /// Exactly one outbound request per call; no retries.
    async fn generate(
        &self,
        agent: &str,
        prompt: &Prompt,
        options: &SamplingOptions,
    ) -> Result<String, LlmError>;
}

/// LLM client that abstracts over multiple providers.
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl LlmClient {
    /// Creates a new LLM client.
    #[instrument(skip(config), fields(provider = ?config.provider()))]
    pub fn new(config: LlmConfig) -> Self {
        info!("Creating LLM client");
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Lists models pulled into the Ollama server.
    #[instrument(skip(self), fields(base_url = %self.config.base_url))]
    async fn list_ollama(&self) -> Result<Vec<String>, LlmError> {
        let url = format!("{}/api/tags", self.config.base_url.trim_end_matches('/'));
        let response = self.http.get(&url).send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::new(
                LlmErrorKind::Transport,
                format!("Ollama tags request failed with {status}"),
            ));
        }

        let body: serde_json::Value = response.json().await.map_err(transport_error)?;
        let models: Vec<String> = body["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        info!(count = models.len(), "Listed Ollama models");
        Ok(models)
    }

    /// Generates a completion using a local Ollama model.
    #[instrument(skip(self, prompt, options))]
    async fn generate_ollama(
        &self,
        model: &str,
        prompt: &Prompt,
        options: &SamplingOptions,
    ) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.config.base_url.trim_end_matches('/'));
        let request_body = serde_json::json!({
            "model": model,
            "system": prompt.system(),
            "prompt": prompt.user(),
            "stream": false,
            "options": {
                "temperature": options.temperature(),
                "num_predict": options.max_tokens(),
            }
        });

        debug!("Sending request to Ollama");
        let response = self
            .http
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let response_text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            error!(status = %status, response = %response_text, "Ollama API error");
            return Err(LlmError::new(
                LlmErrorKind::Transport,
                format!("Ollama API error {}: {}", status, response_text),
            ));
        }

        let response_json: serde_json::Value =
            serde_json::from_str(&response_text).map_err(|e| {
                LlmError::new(
                    LlmErrorKind::Transport,
                    format!("Failed to parse Ollama response: {}", e),
                )
            })?;

        non_empty(response_json["response"].as_str().unwrap_or_default())
    }

    /// Generates a completion using Anthropic Claude.
    #[instrument(skip(self, prompt, options))]
    async fn generate_anthropic(
        &self,
        model: &str,
        prompt: &Prompt,
        options: &SamplingOptions,
    ) -> Result<String, LlmError> {
        let api_key = self.config.api_key().ok_or_else(|| {
            LlmError::new(LlmErrorKind::Transport, "Anthropic API key not configured")
        })?;

        debug!("Building Anthropic API request");
        let request_body = serde_json::json!({
            "model": model,
            "max_tokens": options.max_tokens(),
            "temperature": options.temperature(),
            "system": prompt.system(),
            "messages": [
                {
                    "role": "user",
                    "content": prompt.user()
                }
            ]
        });

        debug!("Sending request to Anthropic");
        let response = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let response_text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            error!(status = %status, response = %response_text, "Anthropic API error");
            return Err(LlmError::new(
                LlmErrorKind::Transport,
                format!("Anthropic API error {}: {}", status, response_text),
            ));
        }

        debug!(response_length = response_text.len(), "Parsing Anthropic response");
        let response_json: serde_json::Value =
            serde_json::from_str(&response_text).map_err(|e| {
                LlmError::new(
                    LlmErrorKind::Transport,
                    format!("Failed to parse response: {}", e),
                )
            })?;

        non_empty(response_json["content"][0]["text"].as_str().unwrap_or_default())
    }

    /// Generates a completion using OpenAI.
    #[instrument(skip(self, prompt, options))]
    async fn generate_openai(
        &self,
        model: &str,
        prompt: &Prompt,
        options: &SamplingOptions,
    ) -> Result<String, LlmError> {
        let api_key = self.config.api_key().ok_or_else(|| {
            LlmError::new(LlmErrorKind::Transport, "OpenAI API key not configured")
        })?;
        let client = OpenAIClient::with_config(OpenAIConfig::new().with_api_key(api_key));

        debug!("Building chat completion request");
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(prompt.system().as_str())
                    .build()
                    .map_err(|e| {
                        LlmError::new(
                            LlmErrorKind::Transport,
                            format!("Failed to build system message: {}", e),
                        )
                    })?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt.user().as_str())
                    .build()
                    .map_err(|e| {
                        LlmError::new(
                            LlmErrorKind::Transport,
                            format!("Failed to build user message: {}", e),
                        )
                    })?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .temperature(*options.temperature())
            .max_tokens(*options.max_tokens())
            .build()
            .map_err(|e| {
                LlmError::new(
                    LlmErrorKind::Transport,
                    format!("Failed to build request: {}", e),
                )
            })?;

        debug!("Sending request to OpenAI");
        let response = client.chat().create(request).await.map_err(|e| {
            LlmError::new(LlmErrorKind::Transport, format!("OpenAI API error: {}", e))
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        non_empty(&content)
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    #[instrument(skip(self), fields(provider = ?self.config.provider))]
    async fn list_agents(&self) -> Result<Vec<String>, LlmError> {
        match self.config.provider {
            LlmProvider::Ollama => self.list_ollama().await,
            LlmProvider::OpenAI | LlmProvider::Anthropic => Ok(self.config.models.clone()),
        }
    }

    #[instrument(skip(self, prompt, options), fields(provider = ?self.config.provider))]
    async fn generate(
        &self,
        agent: &str,
        prompt: &Prompt,
        options: &SamplingOptions,
    ) -> Result<String, LlmError> {
        debug!(temperature = options.temperature, "Generating completion");
        let content = match self.config.provider {
            LlmProvider::Ollama => self.generate_ollama(agent, prompt, options).await,
            LlmProvider::OpenAI => self.generate_openai(agent, prompt, options).await,
            LlmProvider::Anthropic => self.generate_anthropic(agent, prompt, options).await,
        }?;

        info!(content_length = content.len(), "Generated completion");
        Ok(content)
    }
}

/// Rejects blank completions.
#[track_caller]
fn non_empty(content: &str) -> Result<String, LlmError> {
    if content.trim().is_empty() {
        warn!("Provider returned empty completion");
        return Err(LlmError::new(
            LlmErrorKind::EmptyResponse,
            "Provider returned no text",
        ));
    }
    Ok(content.to_string())
}

/// Classifies a reqwest failure.
#[track_caller]
fn transport_error(e: reqwest::Error) -> LlmError {
    let kind = if e.is_timeout() {
        LlmErrorKind::Timeout
    } else {
        LlmErrorKind::Transport
    };
    LlmError::new(kind, format!("HTTP request failed: {}", e))
}

/// Failure category for a generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LlmErrorKind {
    /// Request did not complete in time.
    Timeout,
    /// Network failure, non-2xx status or malformed body.
    Transport,
    /// Request succeeded but produced no text.
    EmptyResponse,
}

/// LLM client error.
#[derive(Debug, Clone, Display, Error)]
#[display("LLM error ({}): {} at {}:{}", kind, message, file, line)]
pub struct LlmError {
    /// Failure category.
    pub kind: LlmErrorKind,
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl LlmError {
    /// Creates a new LLM error.
    #[track_caller]
    #[instrument(skip(message))]
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        let message = message.into();
        error!(error_message = %message, %kind, "LLM error created");
        Self {
            kind,
            message,
            line: loc.line(),
            file: loc.file(),
        }
    }
}
