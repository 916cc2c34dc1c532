//! # converse-store
//!
//! Durable memory for the Converse assistant, on a single SQLite file:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  MemoryStore trait  (what the engine sees)    │
//! ├───────────────┬───────────────┬───────────────┤
//! │ Conversation  │  FactStore    │  VectorStore  │
//! │ log + trash   │  (moka cache) │  + Embedder   │
//! ├───────────────┴───────────────┴───────────────┤
//! │  Database (rusqlite WAL) + migrations         │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ```ignore
//! use std::sync::Arc;
//! use converse_store::{Database, HashingEmbedder, SqliteMemoryStore};
//!
//! let db = Database::open_and_migrate("data/converse.db").await?;
//! let store = SqliteMemoryStore::new(db, Arc::new(HashingEmbedder::default()));
//! ```

pub mod conversation;
pub mod db;
pub mod embedding;
pub mod error;
pub mod facts;
pub mod memory;
pub mod migration;
pub mod vector;

// ── re-exports ───────────────────────────────────────────────────────

pub use conversation::{
    Conversation, ConversationStore, MessageRole, MessageStatus, NewMessage, StoredMessage,
};
pub use db::Database;
pub use embedding::{DEFAULT_DIMENSION, Embedder, HashingEmbedder, cosine_distance};
pub use error::{StoreError, StoreResult};
pub use facts::{Fact, FactStore};
pub use memory::{MemoryStore, PurgeReport, SqliteMemoryStore};
pub use vector::{KIND_CONVERSATION, MemoryRecord, RecordMetadata, ScoredRecord, VectorStore};
