//! Web transport for Converse.
//!
//! This crate exposes the conversation engine over HTTP:
//!
//! - A WebSocket endpoint (`/ws/chat`) streaming turn events as JSON.
//! - A REST API for one-shot chat, history and trash management, memory
//!   records, facts, tools and session preferences.
//! - Health and status endpoints.

pub mod api;
pub mod error;
pub mod server;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use server::WebServer;
pub use state::AppState;
