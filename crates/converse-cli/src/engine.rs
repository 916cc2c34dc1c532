//! Wiring of the conversation engine from configuration: store, provider
//! clients, router, built-in tools and the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use converse_adapters::builtin_tools;
use converse_agent::{
    AppConfig, LlmClient, Orchestrator, Provider, ProviderRouter, RouterSettings, WebSearch,
};
use converse_store::{Database, HashingEmbedder, MemoryStore, SqliteMemoryStore};

/// How often queued store writes are retried.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// A fully wired engine.
pub struct Engine {
    pub config: Arc<AppConfig>,
    pub store: Arc<SqliteMemoryStore>,
    pub orchestrator: Orchestrator,
}

/// Open the database and the embedder described by `config.store`.
pub async fn open_store(config: &AppConfig) -> Result<Arc<SqliteMemoryStore>> {
    let path = config.store.path.clone();
    let db = Database::open_and_migrate(path.clone())
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;
    let embedder = HashingEmbedder::new(config.store.embedding_dimension)
        .context("invalid embedding dimension")?;
    info!(path = %path.display(), dimension = config.store.embedding_dimension, "store initialized");
    Ok(Arc::new(SqliteMemoryStore::new(db, Arc::new(embedder))))
}

/// One HTTP client per configured provider whose API key is present.
pub fn provider_clients(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    for entry in &config.providers {
        match LlmClient::from_config(entry) {
            Ok(client) => {
                info!(provider = %entry.id, "provider ready");
                providers.push(Arc::new(client));
            }
            Err(e) => warn!(provider = %entry.id, error = %e, "provider skipped"),
        }
    }
    providers
}

pub async fn build(config: AppConfig) -> Result<Engine> {
    let config = Arc::new(config);
    let store = open_store(&config).await?;

    let providers = provider_clients(&config);
    if providers.is_empty() {
        bail!("no provider has an API key; set one of the variables listed by `converse status`");
    }
    let router = Arc::new(ProviderRouter::new(
        providers,
        RouterSettings::from_config(&config),
    ));
    if !router.has_provider(&config.router.default_provider) {
        warn!(
            provider = %config.router.default_provider,
            "default provider has no API key; requests must name another provider"
        );
    }

    let builtins = builtin_tools(&config, store.clone() as Arc<dyn MemoryStore>)
        .context("failed to register built-in tools")?;
    let search: Arc<dyn WebSearch> = builtins.search;

    let orchestrator = Orchestrator::new(
        Arc::clone(&config),
        store.clone() as Arc<dyn MemoryStore>,
        router,
        Arc::new(builtins.registry),
        Some(search),
    )
    .context("failed to build orchestrator")?;

    Ok(Engine {
        config,
        store,
        orchestrator,
    })
}

/// Retry queued store writes until `shutdown` fires.
pub fn spawn_reconciler(orchestrator: Orchestrator, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RECONCILE_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if orchestrator.pending_writes() > 0 {
                        orchestrator.reconcile().await;
                    }
                }
            }
        }
        let report = orchestrator.reconcile().await;
        if report.remaining > 0 {
            warn!(remaining = report.remaining, "store writes still pending at shutdown");
        }
    })
}
