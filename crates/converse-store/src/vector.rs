//! Vector index over memory records.
//!
//! Records are embedded on insert and stored with their vector in SQLite.
//! Queries scan every live record and rank by cosine distance; the index is
//! sized for a single user's conversation history, where a linear scan on
//! the blocking pool stays well under a millisecond per thousand records.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::{Database, now_millis};
use crate::embedding::{Embedder, blob_to_embedding, cosine_distance, embedding_to_blob};
use crate::error::{StoreError, StoreResult};

/// Record kind for stored conversation exchanges.
pub const KIND_CONVERSATION: &str = "conversation";

/// Descriptive metadata attached to a memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Record category, e.g. `conversation` or `note`.
    pub kind: String,
    /// Owning user; empty for shared records.
    #[serde(default)]
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Anything else the caller wants to keep with the record.
    #[serde(default)]
    pub extra: Value,
}

impl RecordMetadata {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            owner: String::new(),
            session_id: None,
            extra: Value::Object(Default::default()),
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

/// A stored memory record (without its embedding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// UUIDv7, so lexical order is creation order.
    pub id: String,
    pub text: String,
    pub metadata: RecordMetadata,
    pub created_at: i64,
    /// Set while the record is soft-deleted.
    pub deleted_at: Option<i64>,
}

/// A query hit with its distance to the query text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    /// Cosine distance; smaller is more similar.
    pub distance: f32,
}

const RECORD_COLUMNS: &str = "id, text, kind, owner, session_id, metadata, created_at, deleted_at";

/// SQLite-backed vector index.
#[derive(Clone)]
pub struct VectorStore {
    db: Database,
    embedder: Arc<dyn Embedder>,
}

impl VectorStore {
    pub fn new(db: Database, embedder: Arc<dyn Embedder>) -> Self {
        Self { db, embedder }
    }

    /// Embed and store `text`. Returns the new record id.
    #[instrument(skip(self, text), fields(kind = %metadata.kind))]
    pub async fn add(&self, text: &str, metadata: RecordMetadata) -> StoreResult<String> {
        if text.trim().is_empty() {
            return Err(StoreError::InvalidArgument("cannot index empty text".into()));
        }
        let embedding = self.embed_checked(text).await?;
        let id = Uuid::now_v7().to_string();
        let text = text.to_string();
        let extra = serde_json::to_string(&metadata.extra)?;

        let record_id = id.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO memory_records \
                     (id, text, kind, owner, session_id, metadata, embedding, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        record_id,
                        text,
                        metadata.kind,
                        metadata.owner,
                        metadata.session_id,
                        extra,
                        embedding_to_blob(&embedding),
                        now_millis()
                    ],
                )?;
                Ok(())
            })
            .await?;
        debug!(record_id = %id, "memory record indexed");
        Ok(id)
    }

    /// The `k` live records nearest to `text`, by ascending cosine distance,
    /// ties broken newest first. `owner` restricts the search when given.
    #[instrument(skip(self, text))]
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        owner: Option<&str>,
    ) -> StoreResult<Vec<ScoredRecord>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query = self.embed_checked(text).await?;
        let owner = owner.map(str::to_string);

        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS}, embedding FROM memory_records \
                     WHERE deleted_at IS NULL AND (?1 IS NULL OR owner = ?1)"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![owner], |row| {
                        let blob: Vec<u8> = row.get(8)?;
                        Ok((read_record(row), blob_to_embedding(&blob)))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut scored = Vec::with_capacity(rows.len());
                for (record, embedding) in rows {
                    scored.push(ScoredRecord {
                        record: record?,
                        distance: cosine_distance(&query, &embedding),
                    });
                }
                scored.sort_by(|a, b| {
                    a.distance
                        .total_cmp(&b.distance)
                        .then_with(|| b.record.created_at.cmp(&a.record.created_at))
                        .then_with(|| b.record.id.cmp(&a.record.id))
                });
                scored.truncate(k);
                Ok(scored)
            })
            .await
    }

    /// Fetch a record regardless of its deletion state.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<MemoryRecord> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                conn.query_row(
                    &format!("SELECT {RECORD_COLUMNS} FROM memory_records WHERE id = ?1"),
                    rusqlite::params![id],
                    |row| Ok(read_record(row)),
                )
                .optional()?
                .ok_or_else(|| StoreError::not_found("memory record", &id))?
            })
            .await
    }

    /// Move a record to the trash. Deleting twice keeps the first timestamp.
    #[instrument(skip(self))]
    pub async fn soft_delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let n = conn.execute(
                    "UPDATE memory_records SET deleted_at = COALESCE(deleted_at, ?1) WHERE id = ?2",
                    rusqlite::params![now_millis(), id],
                )?;
                if n == 0 {
                    return Err(StoreError::not_found("memory record", &id));
                }
                debug!(record_id = %id, "memory record soft-deleted");
                Ok(())
            })
            .await
    }

    /// Undo a soft delete. Restoring a live record is a no-op; an unknown id
    /// (never existed or already purged) is `NotFound`.
    #[instrument(skip(self))]
    pub async fn restore(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM memory_records WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(StoreError::not_found("memory record", &id));
                }
                conn.execute(
                    "UPDATE memory_records SET deleted_at = NULL WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
    }

    /// Permanently delete records soft-deleted at least `retention` ago.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, retention: Duration) -> StoreResult<u64> {
        let cutoff = now_millis() - retention.as_millis() as i64;
        self.db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM memory_records WHERE deleted_at IS NOT NULL AND deleted_at <= ?1",
                    rusqlite::params![cutoff],
                )?;
                if n > 0 {
                    info!(purged = n, "expired memory records purged");
                }
                Ok(n as u64)
            })
            .await
    }

    /// Page through records, newest first.
    #[instrument(skip(self))]
    pub async fn list(
        &self,
        limit: u32,
        offset: u32,
        include_deleted: bool,
    ) -> StoreResult<Vec<MemoryRecord>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM memory_records \
                     WHERE ?1 OR deleted_at IS NULL \
                     ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![include_deleted, limit, offset], |row| {
                        Ok(read_record(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().collect()
            })
            .await
    }

    /// Number of live records.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM memory_records WHERE deleted_at IS NULL",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
    }

    async fn embed_checked(&self, text: &str) -> StoreResult<Vec<f32>> {
        let embedding = self.embedder.embed(text).await?;
        if embedding.len() != self.embedder.dimension() {
            return Err(StoreError::Embedding(format!(
                "expected {} dimensions, got {}",
                self.embedder.dimension(),
                embedding.len()
            )));
        }
        Ok(embedding)
    }
}

fn read_record(row: &Row<'_>) -> StoreResult<MemoryRecord> {
    let extra: String = row.get(5)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        text: row.get(1)?,
        metadata: RecordMetadata {
            kind: row.get(2)?,
            owner: row.get(3)?,
            session_id: row.get(4)?,
            extra: serde_json::from_str(&extra)?,
        },
        created_at: row.get(6)?,
        deleted_at: row.get(7)?,
    })
}
