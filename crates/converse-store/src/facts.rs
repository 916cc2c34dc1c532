//! Key/value facts ("the user's name is Ada").
//!
//! Facts are unique per `(owner, key)` and overwritten on set. Reads go
//! through a small `moka` cache since the prompt builder asks for the same
//! owner's facts on every turn.

use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::{Database, now_millis};
use crate::error::{StoreError, StoreResult};

const CACHE_CAPACITY: u64 = 10_000;
const CACHE_TTL: Duration = Duration::from_secs(300);

/// A single stored fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub owner: String,
    pub key: String,
    pub value: String,
    /// Unix milliseconds of the last write.
    pub updated_at: i64,
}

/// Persistent fact store with a read-through cache.
#[derive(Clone)]
pub struct FactStore {
    db: Database,
    cache: Cache<(String, String), Fact>,
}

impl FactStore {
    pub fn new(db: Database) -> Self {
        let cache = Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .time_to_live(CACHE_TTL)
            .build();
        Self { db, cache }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, owner: &str, key: &str) -> StoreResult<Option<Fact>> {
        let cache_key = (owner.to_string(), key.to_string());
        if let Some(fact) = self.cache.get(&cache_key).await {
            return Ok(Some(fact));
        }

        let (owner_q, key_q) = cache_key.clone();
        let fact = self
            .db
            .execute(move |conn| {
                let result = conn.query_row(
                    "SELECT owner, key, value, updated_at FROM facts WHERE owner = ?1 AND key = ?2",
                    rusqlite::params![owner_q, key_q],
                    |row| {
                        Ok(Fact {
                            owner: row.get(0)?,
                            key: row.get(1)?,
                            value: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    },
                );
                match result {
                    Ok(fact) => Ok(Some(fact)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        if let Some(ref fact) = fact {
            self.cache.insert(cache_key, fact.clone()).await;
        }
        Ok(fact)
    }

    /// Insert or overwrite a fact. The write is a single upsert statement.
    #[instrument(skip(self, value))]
    pub async fn set(&self, owner: &str, key: &str, value: &str) -> StoreResult<Fact> {
        let key = key.trim();
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("fact key must not be empty".into()));
        }
        let fact = Fact {
            owner: owner.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            updated_at: now_millis(),
        };

        let row = fact.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO facts (owner, key, value, updated_at) VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(owner, key) DO UPDATE SET value = excluded.value, \
                     updated_at = excluded.updated_at",
                    rusqlite::params![row.owner, row.key, row.value, row.updated_at],
                )?;
                Ok(())
            })
            .await?;

        self.cache
            .insert((fact.owner.clone(), fact.key.clone()), fact.clone())
            .await;
        debug!(owner = %fact.owner, key = %fact.key, "fact stored");
        Ok(fact)
    }

    /// Delete a fact, returning whether it existed.
    #[instrument(skip(self))]
    pub async fn delete(&self, owner: &str, key: &str) -> StoreResult<bool> {
        let cache_key = (owner.to_string(), key.to_string());
        self.cache.invalidate(&cache_key).await;

        let (owner, key) = cache_key;
        self.db
            .execute(move |conn| {
                let n = conn.execute(
                    "DELETE FROM facts WHERE owner = ?1 AND key = ?2",
                    rusqlite::params![owner, key],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// All facts of one owner, ordered by key.
    #[instrument(skip(self))]
    pub async fn list(&self, owner: &str) -> StoreResult<Vec<Fact>> {
        let owner = owner.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT owner, key, value, updated_at FROM facts WHERE owner = ?1 ORDER BY key",
                )?;
                let facts = stmt
                    .query_map(rusqlite::params![owner], |row| {
                        Ok(Fact {
                            owner: row.get(0)?,
                            key: row.get(1)?,
                            value: row.get(2)?,
                            updated_at: row.get(3)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(facts)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> FactStore {
        FactStore::new(Database::in_memory_migrated().await.unwrap())
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let store = store().await;
        store.set("me", "k", "v").await.unwrap();
        assert_eq!(store.get("me", "k").await.unwrap().unwrap().value, "v");
    }

    #[tokio::test]
    async fn missing_fact_is_none() {
        let store = store().await;
        assert!(store.get("me", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_overwrites_and_scopes_by_owner() {
        let store = store().await;
        store.set("me", "name", "Ada").await.unwrap();
        store.set("me", "name", "Grace").await.unwrap();
        store.set("you", "name", "Linus").await.unwrap();

        assert_eq!(store.get("me", "name").await.unwrap().unwrap().value, "Grace");
        assert_eq!(store.get("you", "name").await.unwrap().unwrap().value, "Linus");
        assert_eq!(store.list("me").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_invalidates_cache() {
        let store = store().await;
        store.set("me", "k", "v").await.unwrap();
        store.get("me", "k").await.unwrap();

        assert!(store.delete("me", "k").await.unwrap());
        assert!(store.get("me", "k").await.unwrap().is_none());
        assert!(!store.delete("me", "k").await.unwrap());
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let store = store().await;
        assert!(matches!(
            store.set("me", "  ", "v").await,
            Err(StoreError::InvalidArgument(_))
        ));
    }
}
