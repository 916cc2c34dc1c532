//! CLI argument definitions for Converse.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use converse_agent::Mode;

/// Converse -- a streaming, memory-augmented conversation service.
#[derive(Parser)]
#[command(
    name = "converse",
    version,
    about = "Converse -- streaming conversation service with memory and tools",
    long_about = "Routes chat turns across LLM providers with retries and fallbacks, \
                  augments them with stored memory and live web results, and runs \
                  tool plans for deep research."
)]
pub struct Cli {
    /// Path to the TOML configuration file. Built-in defaults apply when
    /// the file does not exist.
    #[arg(long, short, global = true, default_value = "config/converse.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP and WebSocket server.
    Serve {
        /// Port to listen on (overrides `[server].port`).
        #[arg(long, short)]
        port: Option<u16>,

        /// Address to bind (overrides `[server].bind`).
        #[arg(long)]
        bind: Option<String>,
    },

    /// Chat in the terminal with streamed replies.
    Chat {
        /// Resume or create a session.
        #[arg(long, short)]
        session: Option<String>,

        #[arg(long, short, value_enum, default_value_t = ModeArg::Plain)]
        mode: ModeArg,
    },

    /// Show configuration, provider keys and database counts.
    Status,

    /// Remove trashed conversations and memory older than the retention window.
    Purge,
}

/// Turn mode as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Plain,
    #[value(name = "web_search", alias = "web-search")]
    WebSearch,
    #[value(name = "deep_research", alias = "deep-research")]
    DeepResearch,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Plain => Mode::Plain,
            ModeArg::WebSearch => Mode::WebSearch,
            ModeArg::DeepResearch => Mode::DeepResearch,
        }
    }
}
