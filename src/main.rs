//! LLM Chess Arena - Unified CLI
//!
//! Runs the observer server, headless self-play, or agent discovery.

#![warn(missing_docs)]

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use llm_chess_arena::{
    AppState, ArenaConfig, LlmClient, OracleClient, Participants, RulesEngine, Session,
    SessionHandle, SessionSnapshot, TurnController,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,llm_chess_arena=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = ArenaConfig::load_or_default(&cli.config)?;

    match cli.command {
        Command::Serve { port, host } => run_server(config.with_server(host, port)).await,
        Command::Play {
            white,
            black,
            games,
        } => run_play(config, Participants::new(white, black), games).await,
        Command::Agents => run_agents(config).await,
    }
}

/// Wires rules, oracle and controller into a running session.
#[instrument(skip(config))]
fn spawn_session(
    config: &ArenaConfig,
) -> Result<(SessionHandle, watch::Receiver<SessionSnapshot>)> {
    let rules: Arc<dyn RulesEngine> = Arc::new(config.rules()?);
    let generator = Arc::new(LlmClient::new(config.llm_config()?));
    let oracle = OracleClient::new(generator, config.oracle_settings());
    let controller = TurnController::new(Arc::clone(&rules), oracle.clone(), config.retry_policy());

    Ok(Session::spawn(
        rules,
        controller,
        oracle,
        config.session_settings(),
    ))
}

/// Run the HTTP observer server
#[instrument(skip(config))]
async fn run_server(config: ArenaConfig) -> Result<()> {
    info!("Starting LLM Chess Arena observer server");
    let (handle, snapshots) = spawn_session(&config)?;
    let state = AppState::new(handle, snapshots);

    llm_chess_arena::serve(config.server().host(), *config.server().port(), state).await?;
    Ok(())
}

/// Play games headless until the requested count or Ctrl+C
#[instrument(skip(config))]
async fn run_play(config: ArenaConfig, participants: Participants, games: Option<u32>) -> Result<()> {
    let (handle, mut snapshots) = spawn_session(&config)?;
    handle.start(participants)?;

    let mut last_seen = 0;
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("Session ended");
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();

                let mut fresh: Vec<_> = snapshot
                    .logs()
                    .iter()
                    .filter(|entry| *entry.id() > last_seen)
                    .collect();
                fresh.sort_by_key(|entry| *entry.id());
                for entry in fresh {
                    println!(
                        "[{}] {:<5} {}",
                        entry.timestamp().format("%H:%M:%S"),
                        entry.category(),
                        entry.message()
                    );
                    last_seen = *entry.id();
                }

                if games.is_some_and(|n| snapshot.stats().total() >= n) {
                    info!(games = snapshot.stats().total(), "Requested games finished");
                    handle.stop()?;
                    break;
                }
                if !*snapshot.running() && snapshot.participants().is_some() {
                    info!("Session stopped");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping session");
                handle.stop()?;
                break;
            }
        }
    }

    let snapshot = handle.snapshot().await?;
    let stats = snapshot.stats();
    println!(
        "White wins: {}  Black wins: {}  Draws: {}",
        stats.white_wins(),
        stats.black_wins(),
        stats.draws()
    );
    for game in stats.games().newest_first() {
        println!("#{} {} ({} vs {}): {}", game.id(), game.summary(), game.white(), game.black(), game.pgn());
    }
    Ok(())
}

/// List agents from the configured provider
#[instrument(skip(config))]
async fn run_agents(config: ArenaConfig) -> Result<()> {
    let generator = Arc::new(LlmClient::new(config.llm_config()?));
    let oracle = OracleClient::new(generator, config.oracle_settings());

    let agents = oracle.list_agents().await;
    if agents.is_empty() {
        warn!("No agents available");
    }
    for agent in agents {
        println!("{agent}");
    }
    Ok(())
}
