//! Command-line interface for llm_chess_arena.

use clap::{Parser, Subcommand};

/// LLM Chess Arena - continuous self-play between language-model agents
#[derive(Parser, Debug)]
#[command(name = "llm_chess_arena")]
#[command(about = "Continuous self-play chess between LLM agents", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the arena TOML config (defaults apply if missing)
    #[arg(short, long, global = true, default_value = "arena.toml")]
    pub config: std::path::PathBuf,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP observer server (REST + server-sent events)
    Serve {
        /// Port to bind to (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Play headless games, streaming the session log to stdout
    Play {
        /// Agent playing White
        #[arg(long)]
        white: String,

        /// Agent playing Black
        #[arg(long)]
        black: String,

        /// Stop after this many finished games (runs until Ctrl+C if omitted)
        #[arg(long)]
        games: Option<u32>,
    },

    /// List agents available from the configured provider
    Agents,
}
