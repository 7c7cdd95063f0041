//! Integration tests for live text-generation backends.
//!
//! Run with `--features api` against a local Ollama server or with hosted
//! API keys in `.env`.

use llm_chess_arena::{
    DEFAULT_OLLAMA_URL, LlmClient, LlmConfig, LlmProvider, Prompt, SamplingOptions, TextGenerator,
};
use tracing::instrument;

fn hello() -> Prompt {
    Prompt::new(
        "You are a helpful assistant.".to_string(),
        "Say 'Hello, world!' and nothing else.".to_string(),
    )
}

#[tokio::test]
#[cfg_attr(not(feature = "api"), ignore)]
#[instrument]
async fn test_ollama_connectivity() {
    dotenvy::dotenv().ok();

    let client = LlmClient::new(LlmConfig::new(
        LlmProvider::Ollama,
        None,
        DEFAULT_OLLAMA_URL.to_string(),
        Vec::new(),
    ));

    let agents = client.list_agents().await.expect("Failed to list models");
    let agent = agents.first().expect("No models pulled");

    let response = client
        .generate(agent, &hello(), &SamplingOptions::new(0.1, 50))
        .await
        .expect("Failed to generate");

    assert!(!response.is_empty(), "Response should not be empty");
    eprintln!("Response: {}", response);
}

#[tokio::test]
#[cfg_attr(not(feature = "api"), ignore)]
#[instrument]
async fn test_anthropic_connectivity() {
    dotenvy::dotenv().ok();

    let api_key = std::env::var("ANTHROPIC_API_KEY").expect("ANTHROPIC_API_KEY not set");
    let client = LlmClient::new(LlmConfig::new(
        LlmProvider::Anthropic,
        Some(api_key),
        String::new(),
        vec!["claude-3-5-haiku-20241022".to_string()],
    ));

    let response = client
        .generate("claude-3-5-haiku-20241022", &hello(), &SamplingOptions::new(0.1, 50))
        .await
        .expect("Failed to generate");

    assert!(!response.is_empty(), "Response should not be empty");
    eprintln!("Response: {}", response);
}

#[tokio::test]
#[cfg_attr(not(feature = "api"), ignore)]
#[instrument]
async fn test_openai_connectivity() {
    dotenvy::dotenv().ok();

    let api_key = std::env::var("OPENAI_API_KEY").expect("OPENAI_API_KEY not set");
    let client = LlmClient::new(LlmConfig::new(
        LlmProvider::OpenAI,
        Some(api_key),
        String::new(),
        vec!["gpt-4o-mini".to_string()],
    ));

    assert_eq!(client.list_agents().await.expect("list"), ["gpt-4o-mini"]);

    let response = client
        .generate("gpt-4o-mini", &hello(), &SamplingOptions::new(0.1, 50))
        .await
        .expect("Failed to generate");

    assert!(!response.is_empty(), "Response should not be empty");
    eprintln!("Response: {}", response);
}
