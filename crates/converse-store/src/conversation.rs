//! Durable conversation log.
//!
//! A conversation is the persisted side of a chat session: an ordered list
//! of messages plus the provider/model the session prefers. Conversations
//! are never hard-deleted directly; they move to the trash first and are
//! purged from there, either explicitly or once the retention window has
//! passed.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::{OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::db::{Database, now_millis};
use crate::error::{StoreError, StoreResult};

/// Maximum title length derived from the first user message.
const TITLE_CHARS: usize = 60;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Author of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(StoreError::InvalidArgument(format!("unknown role `{other}`"))),
        }
    }
}

/// Lifecycle status of a persisted message.
///
/// Assistant messages of interrupted turns are kept with `Cancelled` (or
/// `Error`) instead of being dropped, and the user message of a turn that
/// was cancelled before producing any text is flagged `Cancelled` too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Complete,
    Cancelled,
    Error,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "complete" => Ok(Self::Complete),
            "cancelled" => Ok(Self::Cancelled),
            "error" => Ok(Self::Error),
            other => Err(StoreError::InvalidArgument(format!("unknown status `{other}`"))),
        }
    }
}

/// A message about to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    /// Free-form metadata: provider, model, mode flags, language.
    #[serde(default)]
    pub metadata: Value,
}

impl NewMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            status: MessageStatus::Complete,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A message as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Row id; strictly increasing per database, so it is also the append order.
    pub id: i64,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub status: MessageStatus,
    pub metadata: Value,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// Conversation summary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub message_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    /// Set while the conversation sits in the trash.
    pub deleted_at: Option<i64>,
}

// ═══════════════════════════════════════════════════════════════════════
//  ConversationStore
// ═══════════════════════════════════════════════════════════════════════

const CONVERSATION_COLUMNS: &str = "c.id, c.title, c.provider, c.model, \
     (SELECT count(*) FROM messages m WHERE m.conversation_id = c.id), \
     c.created_at, c.updated_at, c.deleted_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, status, metadata, created_at";

/// Append-only message log with trash support.
#[derive(Clone)]
pub struct ConversationStore {
    db: Database,
}

impl ConversationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message, creating the conversation on first use.
    ///
    /// Returns the new message's row id.
    #[instrument(skip(self, message), fields(role = %message.role))]
    pub async fn append(&self, conversation_id: &str, message: NewMessage) -> StoreResult<i64> {
        if conversation_id.is_empty() {
            return Err(StoreError::InvalidArgument("empty conversation id".into()));
        }
        let conversation_id = conversation_id.to_string();
        let metadata = serde_json::to_string(&message.metadata)?;
        let title = if message.role == MessageRole::User {
            message.content.chars().take(TITLE_CHARS).collect()
        } else {
            String::new()
        };

        self.db
            .execute_mut(move |conn| {
                let now = now_millis();
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO conversations (id, title, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?3) \
                     ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at, \
                     title = CASE WHEN conversations.title = '' THEN excluded.title ELSE conversations.title END",
                    rusqlite::params![conversation_id, title, now],
                )?;
                tx.execute(
                    "INSERT INTO messages (conversation_id, role, content, status, metadata, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        conversation_id,
                        message.role.as_str(),
                        message.content,
                        message.status.as_str(),
                        metadata,
                        now
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                debug!(conversation_id = %conversation_id, message_id = id, "message appended");
                Ok(id)
            })
            .await
    }

    /// Change the status of an already persisted message.
    #[instrument(skip(self))]
    pub async fn set_status(&self, message_id: i64, status: MessageStatus) -> StoreResult<()> {
        self.db
            .execute(move |conn| {
                let n = conn.execute(
                    "UPDATE messages SET status = ?1 WHERE id = ?2",
                    rusqlite::params![status.as_str(), message_id],
                )?;
                if n == 0 {
                    return Err(StoreError::not_found("message", message_id));
                }
                Ok(())
            })
            .await
    }

    /// Messages of a conversation in append order; with `limit`, only the
    /// most recent `limit` messages (still ascending).
    #[instrument(skip(self))]
    pub async fn messages(
        &self,
        conversation_id: &str,
        limit: Option<u32>,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conversation_id = conversation_id.to_string();
        self.db
            .execute(move |conn| {
                let sql = match limit {
                    Some(_) => format!(
                        "SELECT {MESSAGE_COLUMNS} FROM \
                         (SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2) \
                         ORDER BY id ASC"
                    ),
                    None => format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
                         AND ?2 IS NULL ORDER BY id ASC"
                    ),
                };
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![conversation_id, limit], |row| {
                        Ok(read_message(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().collect()
            })
            .await
    }

    /// Live (not trashed) conversations, most recently updated first.
    #[instrument(skip(self))]
    pub async fn list(&self, limit: u32, offset: u32) -> StoreResult<Vec<Conversation>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
                     WHERE c.deleted_at IS NULL ORDER BY c.updated_at DESC, c.id DESC \
                     LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit, offset], read_conversation)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Fetch one conversation, trashed or not.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Conversation> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
                    rusqlite::params![id],
                    read_conversation,
                )
                .optional()?
                .ok_or_else(|| StoreError::not_found("conversation", &id))
            })
            .await
    }

    /// Move a conversation to the trash. Trashing twice keeps the first
    /// deletion time.
    #[instrument(skip(self))]
    pub async fn trash(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let n = conn.execute(
                    "UPDATE conversations SET deleted_at = COALESCE(deleted_at, ?1) WHERE id = ?2",
                    rusqlite::params![now_millis(), id],
                )?;
                if n == 0 {
                    return Err(StoreError::not_found("conversation", &id));
                }
                info!(conversation_id = %id, "conversation moved to trash");
                Ok(())
            })
            .await
    }

    /// Bring a conversation back from the trash. Returns `false` when it was
    /// not trashed (restoring is idempotent).
    #[instrument(skip(self))]
    pub async fn restore(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted_at: Option<Option<i64>> = conn
                    .query_row(
                        "SELECT deleted_at FROM conversations WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match deleted_at {
                    None => Err(StoreError::not_found("conversation", &id)),
                    Some(None) => Ok(false),
                    Some(Some(_)) => {
                        conn.execute(
                            "UPDATE conversations SET deleted_at = NULL WHERE id = ?1",
                            rusqlite::params![id],
                        )?;
                        info!(conversation_id = %id, "conversation restored");
                        Ok(true)
                    }
                }
            })
            .await
    }

    /// Trashed conversations, most recently deleted first.
    #[instrument(skip(self))]
    pub async fn list_trash(&self) -> StoreResult<Vec<Conversation>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
                     WHERE c.deleted_at IS NOT NULL ORDER BY c.deleted_at DESC"
                ))?;
                let rows = stmt
                    .query_map([], read_conversation)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Permanently remove one trashed conversation and its messages.
    ///
    /// Live conversations must be trashed first.
    #[instrument(skip(self))]
    pub async fn purge(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM conversations WHERE id = ?1 AND deleted_at IS NOT NULL",
                    rusqlite::params![id],
                )?;
                if n == 0 {
                    return Err(StoreError::not_found("trashed conversation", &id));
                }
                info!(conversation_id = %id, "conversation purged");
                Ok(())
            })
            .await
    }

    /// Purge everything in the trash. Returns the number of conversations removed.
    #[instrument(skip(self))]
    pub async fn empty_trash(&self) -> StoreResult<u64> {
        self.db
            .execute(|conn| {
                let n = conn.execute("DELETE FROM conversations WHERE deleted_at IS NOT NULL", [])?;
                info!(purged = n, "trash emptied");
                Ok(n as u64)
            })
            .await
    }

    /// Purge conversations that have been in the trash for at least `retention`.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, retention: Duration) -> StoreResult<u64> {
        let cutoff = now_millis() - retention.as_millis() as i64;
        self.db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM conversations WHERE deleted_at IS NOT NULL AND deleted_at <= ?1",
                    rusqlite::params![cutoff],
                )?;
                if n > 0 {
                    info!(purged = n, "expired conversations purged");
                }
                Ok(n as u64)
            })
            .await
    }

    /// Remember a conversation's preferred provider and model.
    #[instrument(skip(self))]
    pub async fn set_preferences(
        &self,
        id: &str,
        provider: Option<&str>,
        model: Option<&str>,
    ) -> StoreResult<()> {
        let id = id.to_string();
        let provider = provider.map(str::to_string);
        let model = model.map(str::to_string);
        self.db
            .execute(move |conn| {
                let now = now_millis();
                conn.execute(
                    "INSERT INTO conversations (id, provider, model, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?4) \
                     ON CONFLICT(id) DO UPDATE SET provider = excluded.provider, \
                     model = excluded.model, updated_at = excluded.updated_at",
                    rusqlite::params![id, provider, model, now],
                )?;
                Ok(())
            })
            .await
    }

    /// Total number of stored messages across all conversations.
    pub async fn message_count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| Ok(conn.query_row("SELECT count(*) FROM messages", [], |r| r.get(0))?))
            .await
    }
}

fn read_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        title: row.get(1)?,
        provider: row.get(2)?,
        model: row.get(3)?,
        message_count: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}

/// Decode a message row; enum and JSON columns are validated after the
/// rusqlite pass so their errors surface as [`StoreError`].
fn read_message(row: &Row<'_>) -> StoreResult<StoredMessage> {
    let role: String = row.get(2)?;
    let status: String = row.get(4)?;
    let metadata: String = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: role.parse()?,
        content: row.get(3)?,
        status: status.parse()?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: row.get(6)?,
    })
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ConversationStore {
        ConversationStore::new(Database::in_memory_migrated().await.unwrap())
    }

    #[tokio::test]
    async fn append_creates_conversation_and_titles_it() {
        let store = store().await;
        store.append("s1", NewMessage::user("What is 2+2?")).await.unwrap();
        store.append("s1", NewMessage::assistant("4")).await.unwrap();

        let conv = store.get("s1").await.unwrap();
        assert_eq!(conv.title, "What is 2+2?");
        assert_eq!(conv.message_count, 2);
        assert!(conv.deleted_at.is_none());
    }

    #[tokio::test]
    async fn messages_with_limit_keep_latest_in_order() {
        let store = store().await;
        for i in 0..5 {
            store.append("s1", NewMessage::user(format!("msg {i}"))).await.unwrap();
        }
        let recent = store.messages("s1", Some(3)).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["msg 2", "msg 3", "msg 4"]);

        let all = store.messages("s1", None).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn status_and_metadata_round_trip() {
        let store = store().await;
        let id = store
            .append(
                "s1",
                NewMessage::assistant("partial")
                    .with_status(MessageStatus::Pending)
                    .with_metadata(serde_json::json!({"provider": "groq"})),
            )
            .await
            .unwrap();
        store.set_status(id, MessageStatus::Cancelled).await.unwrap();

        let msgs = store.messages("s1", None).await.unwrap();
        assert_eq!(msgs[0].status, MessageStatus::Cancelled);
        assert_eq!(msgs[0].metadata["provider"], "groq");
    }

    #[tokio::test]
    async fn set_status_on_missing_message_is_not_found() {
        let store = store().await;
        let err = store.set_status(99, MessageStatus::Error).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn trash_hides_from_list_and_restore_is_idempotent() {
        let store = store().await;
        store.append("a", NewMessage::user("one")).await.unwrap();
        store.append("b", NewMessage::user("two")).await.unwrap();

        store.trash("a").await.unwrap();
        let live: Vec<_> = store.list(10, 0).await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(live, ["b"]);
        assert_eq!(store.list_trash().await.unwrap().len(), 1);

        assert!(store.restore("a").await.unwrap());
        assert!(!store.restore("a").await.unwrap());
        assert!(store.list_trash().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_requires_trash() {
        let store = store().await;
        store.append("a", NewMessage::user("one")).await.unwrap();
        assert!(store.purge("a").await.is_err());

        store.trash("a").await.unwrap();
        store.purge("a").await.unwrap();
        assert!(matches!(store.get("a").await, Err(StoreError::NotFound { .. })));
        assert!(store.messages("a", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_expired_respects_retention() {
        let store = store().await;
        store.append("a", NewMessage::user("one")).await.unwrap();
        store.trash("a").await.unwrap();

        assert_eq!(store.purge_expired(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(store.purge_expired(Duration::ZERO).await.unwrap(), 1);
        assert!(store.list_trash().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_trash_counts_removed() {
        let store = store().await;
        for id in ["a", "b", "c"] {
            store.append(id, NewMessage::user(id)).await.unwrap();
        }
        store.trash("a").await.unwrap();
        store.trash("b").await.unwrap();
        assert_eq!(store.empty_trash().await.unwrap(), 2);
        assert_eq!(store.list(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn preferences_are_stored() {
        let store = store().await;
        store.set_preferences("s", Some("groq"), Some("llama-3.1-8b-instant")).await.unwrap();
        let conv = store.get("s").await.unwrap();
        assert_eq!(conv.provider.as_deref(), Some("groq"));
        assert_eq!(conv.model.as_deref(), Some("llama-3.1-8b-instant"));
    }
}
