//! CLI entry point for Converse.
//!
//! This binary provides the `converse` command with subcommands for serving
//! the HTTP/WebSocket API, chatting in the terminal, checking status and
//! purging expired trash.

mod cli;
mod engine;
mod helpers;
mod repl;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use converse_agent::{AppConfig, BusyPolicy};
use converse_store::MemoryStore;
use converse_web::{AppState, WebServer};

use crate::cli::{Cli, Commands};
use crate::helpers::{env_present, init_tracing, load_config};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Chat { .. } | Commands::Status => "warn",
        Commands::Serve { .. } | Commands::Purge => "info",
    };
    init_tracing(default_level, cli.log_json);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Serve { port, bind } => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            cmd_serve(config).await
        }
        Commands::Chat { session, mode } => {
            let engine = engine::build(config).await?;
            repl::cmd_chat(engine, session, mode.into()).await
        }
        Commands::Status => cmd_status(config).await,
        Commands::Purge => cmd_purge(config).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(config: AppConfig) -> Result<()> {
    let engine = engine::build(config).await?;
    info!(
        providers = ?engine.orchestrator.router().provider_ids(),
        tools = engine.orchestrator.registry().len(),
        "engine ready"
    );

    let shutdown = CancellationToken::new();
    let reconciler = engine::spawn_reconciler(engine.orchestrator.clone(), shutdown.clone());

    let server = WebServer::new(AppState::new(engine.orchestrator, engine.store));
    let signal = shutdown.clone();
    let stop = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
        signal.cancel();
    };

    let result = server.start(stop).await.context("web server failed");
    shutdown.cancel();
    if let Err(e) = reconciler.await {
        tracing::warn!(error = %e, "reconciler task failed");
    }
    result
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(config: AppConfig) -> Result<()> {
    println!();
    println!("  Converse Status");
    println!("  ===============");
    println!();
    println!("  Default target:   {}", config.default_target());
    println!("  Default tier:     {}", config.router.default_tier);
    println!("  Busy policy:      {}", policy_label(config.session.busy_policy));
    println!("  Server:           {}:{}", config.server.bind, config.server.port);
    println!();

    println!("  Providers:");
    for provider in &config.providers {
        let key = match provider.api_key_env.as_deref() {
            Some(var) if env_present(var) => format!("{var} set"),
            Some(var) => format!("{var} NOT SET"),
            None => "no key required".to_owned(),
        };
        println!("    {:<12} {key}", provider.id);
    }
    println!();

    let store = engine::open_store(&config).await?;
    let conversations = store.conversations();
    let live = conversations.list(u32::MAX, 0).await.context("failed to list conversations")?;
    let trashed = conversations.list_trash().await.context("failed to list trash")?;
    let messages = conversations.message_count().await.context("failed to count messages")?;
    let memory = store.vectors().count().await.context("failed to count memory records")?;

    println!("  Database:         {}", config.store.path.display());
    println!("    conversations   {} ({} in trash)", live.len(), trashed.len());
    println!("    messages        {messages}");
    println!("    memory records  {memory}");
    println!("    retention       {} days", config.store.retention_days);
    println!();

    Ok(())
}

fn policy_label(policy: BusyPolicy) -> &'static str {
    match policy {
        BusyPolicy::Reject => "reject",
        BusyPolicy::Preempt => "preempt",
    }
}

// ---------------------------------------------------------------------------
// Subcommand: purge
// ---------------------------------------------------------------------------

async fn cmd_purge(config: AppConfig) -> Result<()> {
    let store = engine::open_store(&config).await?;
    let report = store
        .purge_expired(config.retention())
        .await
        .context("failed to purge expired trash")?;
    println!(
        "  Purged {} conversations and {} memory records older than {} days.",
        report.conversations, report.memory_records, config.store.retention_days
    );
    Ok(())
}
