//! Subcommand: `converse chat` -- terminal REPL.
//!
//! Reads one message per line, streams the reply tokens as they arrive and
//! prints tool progress and notices inline. Ctrl-C exits; a reply in flight
//! is cancelled and persisted as such.

use std::io::{self, Write};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use uuid::Uuid;

use converse_agent::{Mode, TurnEvent, TurnRequest};

use crate::engine::Engine;

/// Run the interactive chat loop.
pub async fn cmd_chat(engine: Engine, session: Option<String>, mut mode: Mode) -> Result<()> {
    let session_id = session
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let orchestrator = &engine.orchestrator;

    let previous = engine
        .store
        .conversations()
        .messages(&session_id, None)
        .await
        .context("failed to load session history")?;

    println!();
    println!("  Converse v{}", env!("CARGO_PKG_VERSION"));
    println!("  Session:  {session_id}");
    println!("  Provider: {}", engine.config.default_target());
    if !previous.is_empty() {
        println!("  Resuming: {} earlier messages", previous.len());
    }
    println!("  Type a message, `/mode plain|web_search|deep_research`, or `quit`.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = io::stdout();

    'repl: loop {
        print!("you> ");
        stdout.flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read input")?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "quit" || trimmed == "exit" {
            break;
        }
        if let Some(arg) = trimmed.strip_prefix("/mode") {
            match arg.trim().parse::<Mode>() {
                Ok(m) => {
                    mode = m;
                    println!("  mode: {mode}");
                }
                Err(e) => println!("  {e}"),
            }
            continue;
        }

        let request = TurnRequest::new(&session_id, trimmed).with_mode(mode);
        let mut stream = match orchestrator.handle(request).await {
            Ok(stream) => stream,
            Err(e) => {
                println!("  Error ({}): {e}", e.kind());
                continue;
            }
        };

        print!("assistant> ");
        stdout.flush()?;
        loop {
            let event = tokio::select! {
                event = stream.next() => event,
                // Dropping the stream cancels the turn.
                _ = tokio::signal::ctrl_c() => break 'repl,
            };
            let Some(event) = event else { break };
            if render(&event, &mut stdout)? {
                break;
            }
        }
    }

    println!();
    orchestrator.close_session(&session_id);
    let report = orchestrator.reconcile().await;
    info!(%session_id, remaining = report.remaining, "chat session ended");
    Ok(())
}

/// Print one event. Returns `true` for the terminal event.
fn render(event: &TurnEvent, out: &mut impl Write) -> io::Result<bool> {
    match event {
        TurnEvent::Thinking { .. } => {}
        TurnEvent::Token { text, .. } => {
            write!(out, "{text}")?;
            out.flush()?;
        }
        TurnEvent::Info { message, .. } => writeln!(out, "\n  [info] {message}")?,
        TurnEvent::ToolStarted {
            step,
            tool,
            description,
            ..
        } => writeln!(out, "\n  [step {}] {tool}: {description}", step + 1)?,
        TurnEvent::ToolFinished {
            step,
            tool,
            ok,
            duration_ms,
            error,
            ..
        } => {
            let status = if *ok { "done" } else { "failed" };
            write!(out, "  [step {}] {tool} {status} in {duration_ms}ms", step + 1)?;
            match error {
                Some(e) => writeln!(out, ": {e}")?,
                None => writeln!(out)?,
            }
        }
        TurnEvent::Complete {
            served_by,
            usage,
            durable,
            ..
        } => {
            writeln!(out)?;
            let saved = if *durable { "" } else { ", not yet saved" };
            writeln!(
                out,
                "  ({served_by}, {} tokens{saved})",
                usage.input_tokens + usage.output_tokens
            )?;
            return Ok(true);
        }
        TurnEvent::Error { kind, reason, .. } => {
            writeln!(out, "\n  Error ({kind}): {reason}")?;
            return Ok(true);
        }
        TurnEvent::Cancelled { .. } => {
            writeln!(out, "\n  [cancelled]")?;
            return Ok(true);
        }
    }
    Ok(false)
}
