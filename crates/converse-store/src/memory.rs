//! The memory store interface consumed by the conversation engine.
//!
//! [`MemoryStore`] is the only storage surface the orchestrator and the
//! retrieval engine see. [`SqliteMemoryStore`] implements it on top of the
//! conversation log, the fact store and the vector index, and also hands out
//! those stores directly for administrative surfaces (history paging,
//! trash management).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationStore, MessageStatus, NewMessage, StoredMessage};
use crate::db::Database;
use crate::embedding::Embedder;
use crate::error::StoreResult;
use crate::facts::{Fact, FactStore};
use crate::vector::{KIND_CONVERSATION, RecordMetadata, ScoredRecord, VectorStore};

/// Counts of rows removed by [`MemoryStore::purge_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub memory_records: u64,
    pub conversations: u64,
}

/// Storage operations used by the conversation engine.
///
/// Every method is a single-record operation and atomic on its own;
/// implementations must tolerate concurrent callers.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Index `text` for similarity search. Returns the record id.
    async fn add_vector(&self, text: &str, metadata: RecordMetadata) -> StoreResult<String>;

    /// Nearest live records to `text`, ascending distance, ties newest first.
    async fn query_vector(
        &self,
        text: &str,
        k: usize,
        owner: Option<&str>,
    ) -> StoreResult<Vec<ScoredRecord>>;

    async fn soft_delete(&self, id: &str) -> StoreResult<()>;

    /// Idempotent: restoring a live record succeeds without change.
    async fn restore(&self, id: &str) -> StoreResult<()>;

    /// Drop trashed memory records and conversations older than `retention`.
    async fn purge_expired(&self, retention: Duration) -> StoreResult<PurgeReport>;

    async fn get_fact(&self, owner: &str, key: &str) -> StoreResult<Option<Fact>>;

    async fn set_fact(&self, owner: &str, key: &str, value: &str) -> StoreResult<Fact>;

    async fn delete_fact(&self, owner: &str, key: &str) -> StoreResult<bool>;

    async fn list_facts(&self, owner: &str) -> StoreResult<Vec<Fact>>;

    /// Append to a session's log. Returns the message id.
    async fn append_message(&self, session_id: &str, message: NewMessage) -> StoreResult<i64>;

    async fn set_message_status(&self, message_id: i64, status: MessageStatus) -> StoreResult<()>;

    /// The last `limit` messages of a session (all when `None`), oldest first.
    async fn list_messages(
        &self,
        session_id: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<StoredMessage>>;

    /// Index one user/assistant exchange as a `conversation` record.
    async fn add_conversation(
        &self,
        user: &str,
        assistant: &str,
        metadata: RecordMetadata,
    ) -> StoreResult<String> {
        let text = format!("User: {user}\nAssistant: {assistant}");
        let metadata = RecordMetadata {
            kind: KIND_CONVERSATION.to_string(),
            ..metadata
        };
        self.add_vector(&text, metadata).await
    }
}

/// [`MemoryStore`] over a single SQLite database.
#[derive(Clone)]
pub struct SqliteMemoryStore {
    db: Database,
    conversations: ConversationStore,
    facts: FactStore,
    vectors: VectorStore,
}

impl SqliteMemoryStore {
    pub fn new(db: Database, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            conversations: ConversationStore::new(db.clone()),
            facts: FactStore::new(db.clone()),
            vectors: VectorStore::new(db.clone(), embedder),
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn facts(&self) -> &FactStore {
        &self.facts
    }

    pub fn vectors(&self) -> &VectorStore {
        &self.vectors
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn add_vector(&self, text: &str, metadata: RecordMetadata) -> StoreResult<String> {
        self.vectors.add(text, metadata).await
    }

    async fn query_vector(
        &self,
        text: &str,
        k: usize,
        owner: Option<&str>,
    ) -> StoreResult<Vec<ScoredRecord>> {
        self.vectors.query(text, k, owner).await
    }

    async fn soft_delete(&self, id: &str) -> StoreResult<()> {
        self.vectors.soft_delete(id).await
    }

    async fn restore(&self, id: &str) -> StoreResult<()> {
        self.vectors.restore(id).await
    }

    async fn purge_expired(&self, retention: Duration) -> StoreResult<PurgeReport> {
        Ok(PurgeReport {
            memory_records: self.vectors.purge_expired(retention).await?,
            conversations: self.conversations.purge_expired(retention).await?,
        })
    }

    async fn get_fact(&self, owner: &str, key: &str) -> StoreResult<Option<Fact>> {
        self.facts.get(owner, key).await
    }

    async fn set_fact(&self, owner: &str, key: &str, value: &str) -> StoreResult<Fact> {
        self.facts.set(owner, key, value).await
    }

    async fn delete_fact(&self, owner: &str, key: &str) -> StoreResult<bool> {
        self.facts.delete(owner, key).await
    }

    async fn list_facts(&self, owner: &str) -> StoreResult<Vec<Fact>> {
        self.facts.list(owner).await
    }

    async fn append_message(&self, session_id: &str, message: NewMessage) -> StoreResult<i64> {
        self.conversations.append(session_id, message).await
    }

    async fn set_message_status(&self, message_id: i64, status: MessageStatus) -> StoreResult<()> {
        self.conversations.set_status(message_id, status).await
    }

    async fn list_messages(
        &self,
        session_id: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<StoredMessage>> {
        self.conversations.messages(session_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    async fn store() -> SqliteMemoryStore {
        let db = Database::in_memory_migrated().await.unwrap();
        SqliteMemoryStore::new(db, Arc::new(HashingEmbedder::default()))
    }

    #[tokio::test]
    async fn add_conversation_formats_exchange() {
        let store = store().await;
        let id = store
            .add_conversation("hi", "hello there", RecordMetadata::new("ignored").owner("me"))
            .await
            .unwrap();
        let record = store.vectors().get(&id).await.unwrap();
        assert_eq!(record.text, "User: hi\nAssistant: hello there");
        assert_eq!(record.metadata.kind, KIND_CONVERSATION);
        assert_eq!(record.metadata.owner, "me");
    }

    #[tokio::test]
    async fn purge_expired_reports_both_kinds() {
        let store = store().await;
        let id = store.add_vector("note", RecordMetadata::new("note")).await.unwrap();
        store.soft_delete(&id).await.unwrap();
        store.append_message("s", NewMessage::user("x")).await.unwrap();
        store.conversations().trash("s").await.unwrap();

        let report = store.purge_expired(Duration::ZERO).await.unwrap();
        assert_eq!(report, PurgeReport { memory_records: 1, conversations: 1 });
    }

    #[tokio::test]
    async fn trait_object_is_usable() {
        let store: Arc<dyn MemoryStore> = Arc::new(store().await);
        store.set_fact("me", "k", "v").await.unwrap();
        assert_eq!(store.get_fact("me", "k").await.unwrap().unwrap().value, "v");
        assert_eq!(store.list_facts("me").await.unwrap().len(), 1);
    }
}
