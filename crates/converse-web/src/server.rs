//! Web server setup and startup.
//!
//! [`WebServer`] composes the Axum router, registers all routes, and starts
//! the HTTP listener.

use std::sync::Arc;

use axum::Router;
use axum::http::Method;
use axum::routing::{delete, get, post, put};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::state::AppState;
use crate::ws;

/// The Converse web server.
pub struct WebServer {
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Return the `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        let server = &self.state.config.server;
        format!("{}:{}", server.bind, server.port)
    }

    /// Build the Axum router with all routes registered.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers(Any);

        Router::new()
            .route("/api/health", get(api::health))
            .route("/api/status", get(api::status))
            .route("/api/chat", post(api::chat))
            // Conversation history and trash.
            .route("/api/history", get(api::list_history))
            .route("/api/history/{id}", get(api::get_history).delete(api::delete_history))
            .route("/api/trash", get(api::list_trash))
            .route("/api/trash/empty", delete(api::empty_trash))
            .route("/api/trash/purge-expired", post(api::purge_expired))
            .route("/api/trash/{id}", delete(api::purge_trash))
            .route("/api/trash/{id}/restore", post(api::restore_trash))
            // Memory records and facts.
            .route("/api/memory", get(api::list_memory))
            .route("/api/memory/search", get(api::search_memory))
            .route("/api/memory/{id}", delete(api::delete_memory))
            .route("/api/memory/{id}/restore", post(api::restore_memory))
            .route("/api/facts", get(api::list_facts))
            .route("/api/facts/{key}", put(api::put_fact).delete(api::delete_fact))
            // Tools and session preferences.
            .route("/api/tools", get(api::tools))
            .route("/api/sessions/{id}/provider", put(api::set_session_provider))
            // WebSocket.
            .route("/ws/chat", get(ws::ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Start the server and run until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP listener cannot be bound.
    pub async fn start(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let addr = self.addr();
        let router = self.router();

        tracing::info!(addr = %addr, "starting web server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("web server stopped");
        Ok(())
    }
}
