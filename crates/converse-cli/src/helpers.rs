//! Shared helper functions used across CLI subcommands: tracing
//! initialization and configuration loading.

use std::path::Path;

use anyhow::{Context, Result};
use converse_agent::AppConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Load `.env` and the TOML configuration. A missing file means defaults.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    match dotenvy::dotenv() {
        Ok(env_path) => info!(path = %env_path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => return Err(e).context("failed to read .env"),
    }

    if !path.exists() {
        info!(path = %path.display(), "config file not found, using defaults");
        let config = AppConfig::default();
        config.validate().context("built-in configuration is invalid")?;
        return Ok(config);
    }

    let config = AppConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Whether an environment variable is set to something non-blank.
pub fn env_present(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| !v.trim().is_empty())
}
