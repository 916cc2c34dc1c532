//! Shared application state for the web server.
//!
//! [`AppState`] is wrapped in an `Arc` and shared across all request handlers
//! and WebSocket connections. The orchestrator owns the turn pipeline; the
//! SQLite store is kept alongside it for the administrative surfaces
//! (history, trash, memory records) that sit outside the engine.

use std::sync::Arc;
use std::time::Instant;

use converse_agent::{AppConfig, Orchestrator, ProviderTarget};
use converse_store::{ConversationStore, SqliteMemoryStore, StoreError};

/// Shared state accessible from every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// The conversation engine.
    pub orchestrator: Orchestrator,

    /// Concrete store behind the orchestrator's `MemoryStore`.
    pub store: Arc<SqliteMemoryStore>,

    /// Configuration the orchestrator was built with.
    pub config: Arc<AppConfig>,

    /// Server start, for uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, store: Arc<SqliteMemoryStore>) -> Self {
        let config = Arc::clone(orchestrator.config());
        Self {
            orchestrator,
            store,
            config,
            started_at: Instant::now(),
        }
    }

    pub fn conversations(&self) -> &ConversationStore {
        self.store.conversations()
    }

    /// Load a session's stored provider/model into the orchestrator unless
    /// it already has an in-memory preference.
    pub async fn restore_preference(&self, session_id: &str) {
        if self.orchestrator.sessions().preference(session_id).is_some() {
            return;
        }
        let conversation = match self.conversations().get(session_id).await {
            Ok(c) => c,
            Err(StoreError::NotFound { .. }) => return,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "could not load session preference");
                return;
            }
        };
        if let (Some(provider), Some(model)) = (conversation.provider, conversation.model) {
            let target = ProviderTarget::new(provider, model);
            if let Err(e) = self.orchestrator.set_preference(session_id, Some(target)) {
                tracing::warn!(session_id, error = %e, "stored session preference no longer valid");
            }
        }
    }
}
