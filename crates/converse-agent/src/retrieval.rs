//! Retrieval engine.
//!
//! Builds the context bundle for one turn from two independent sources: a
//! similarity query over the memory store and, when web grounding is
//! requested, the external search collaborator. Both run concurrently under
//! their own timeouts. A failing source degrades to nothing plus a warning;
//! retrieval never fails a turn.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use converse_store::MemoryStore;

use crate::config::AppConfig;
use crate::error::{AgentError, ToolError};

// ---------------------------------------------------------------------------
// Search collaborator
// ---------------------------------------------------------------------------

/// One web search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// External web search.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, count: usize) -> Result<Vec<SearchHit>, ToolError>;
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// One piece of retrieved context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ContextItem {
    Memory {
        id: String,
        text: String,
        distance: f32,
    },
    Web {
        title: String,
        url: String,
        snippet: String,
    },
}

impl ContextItem {
    /// Characters this item contributes to the bundle budget.
    pub fn cost(&self) -> usize {
        match self {
            Self::Memory { text, .. } => text.chars().count(),
            Self::Web {
                title,
                url,
                snippet,
            } => title.chars().count() + url.chars().count() + snippet.chars().count(),
        }
    }

    /// Shrink the item to at most `max_chars`. Returns `false` when it
    /// cannot fit at all: a web result whose URL alone is over budget.
    fn truncate_to(&mut self, max_chars: usize) -> bool {
        match self {
            Self::Memory { text, .. } => {
                *text = truncate_chars(text, max_chars);
                true
            }
            Self::Web {
                title,
                url,
                snippet,
            } => {
                let Some(room) = max_chars.checked_sub(url.chars().count()) else {
                    return false;
                };
                *title = truncate_chars(title, room);
                let room = room - title.chars().count();
                *snippet = truncate_chars(snippet, room);
                true
            }
        }
    }
}

/// Ranked context for one query: memory items first, then web items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub items: Vec<ContextItem>,
    /// Soft warnings from degraded sources.
    pub warnings: Vec<String>,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_chars(&self) -> usize {
        self.items.iter().map(ContextItem::cost).sum()
    }

    pub fn memory(&self) -> impl Iterator<Item = &ContextItem> {
        self.items
            .iter()
            .filter(|i| matches!(i, ContextItem::Memory { .. }))
    }

    pub fn web(&self) -> impl Iterator<Item = &ContextItem> {
        self.items
            .iter()
            .filter(|i| matches!(i, ContextItem::Web { .. }))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub item_chars: usize,
    pub total_chars: usize,
    pub max_distance: f32,
    pub vector_timeout: Duration,
    pub search_timeout: Duration,
    pub search_results: usize,
}

impl RetrievalSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let r = &config.retrieval;
        Self {
            top_k: r.top_k,
            item_chars: r.item_chars,
            total_chars: r.total_chars,
            max_distance: r.max_distance,
            vector_timeout: Duration::from_millis(r.vector_timeout_ms),
            search_timeout: Duration::from_millis(r.search_timeout_ms),
            search_results: r.search_results,
        }
    }
}

/// What to look up.
#[derive(Debug, Clone, Default)]
pub struct RetrievalQuery {
    /// The user message.
    pub text: String,
    /// Recent turns, oldest first, appended to the similarity query.
    pub recent: Vec<String>,
    /// Restrict memory to one owner.
    pub owner: Option<String>,
    pub memory: bool,
    pub web: bool,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            memory: true,
            ..Self::default()
        }
    }

    pub fn with_web(mut self, web: bool) -> Self {
        self.web = web;
        self
    }

    pub fn with_memory(mut self, memory: bool) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_recent(mut self, recent: Vec<String>) -> Self {
        self.recent = recent;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    fn similarity_text(&self) -> String {
        if self.recent.is_empty() {
            return self.text.clone();
        }
        let mut text = self.recent.join("\n");
        text.push('\n');
        text.push_str(&self.text);
        text
    }
}

pub struct RetrievalEngine {
    store: Arc<dyn MemoryStore>,
    search: Option<Arc<dyn WebSearch>>,
    settings: RetrievalSettings,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        search: Option<Arc<dyn WebSearch>>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            store,
            search,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    pub fn has_search(&self) -> bool {
        self.search.is_some()
    }

    /// Build a bundle with at most `k` memory items.
    pub async fn retrieve(&self, query: &RetrievalQuery, k: usize) -> ContextBundle {
        let (memory, web) = tokio::join!(self.lookup_memory(query, k), self.lookup_web(query));

        let mut warnings = Vec::new();
        let mut items = Vec::new();
        match memory {
            Ok(found) => items.extend(found),
            Err(e) => {
                tracing::warn!(error = %e, "memory lookup degraded");
                warnings.push(format!("Memory unavailable: {e}"));
            }
        }
        match web {
            Ok(found) => items.extend(found),
            Err(e) => {
                tracing::warn!(error = %e, "web search degraded");
                warnings.push(format!("Web search unavailable: {e}"));
            }
        }

        let items = apply_budgets(items, self.settings.item_chars, self.settings.total_chars);
        tracing::debug!(
            items = items.len(),
            warnings = warnings.len(),
            "context bundle built"
        );
        ContextBundle { items, warnings }
    }

    async fn lookup_memory(
        &self,
        query: &RetrievalQuery,
        k: usize,
    ) -> Result<Vec<ContextItem>, AgentError> {
        if !query.memory || k == 0 {
            return Ok(Vec::new());
        }
        let text = query.similarity_text();
        let lookup = self.store.query_vector(&text, k, query.owner.as_deref());
        let records = tokio::time::timeout(self.settings.vector_timeout, lookup)
            .await
            .map_err(|_| AgentError::Retrieval {
                source_name: "memory",
                reason: format!(
                    "timed out after {}ms",
                    self.settings.vector_timeout.as_millis()
                ),
            })?
            .map_err(|e| AgentError::Retrieval {
                source_name: "memory",
                reason: e.to_string(),
            })?;

        Ok(records
            .into_iter()
            .filter(|r| r.distance <= self.settings.max_distance)
            .map(|r| ContextItem::Memory {
                id: r.record.id,
                text: r.record.text,
                distance: r.distance,
            })
            .collect())
    }

    async fn lookup_web(&self, query: &RetrievalQuery) -> Result<Vec<ContextItem>, AgentError> {
        if !query.web {
            return Ok(Vec::new());
        }
        let Some(search) = &self.search else {
            return Err(AgentError::Retrieval {
                source_name: "web search",
                reason: "no search collaborator configured".into(),
            });
        };

        let lookup = search.search(&query.text, self.settings.search_results);
        let hits = tokio::time::timeout(self.settings.search_timeout, lookup)
            .await
            .map_err(|_| AgentError::Retrieval {
                source_name: "web search",
                reason: format!(
                    "timed out after {}ms",
                    self.settings.search_timeout.as_millis()
                ),
            })?
            .map_err(|e| AgentError::Retrieval {
                source_name: "web search",
                reason: e.to_string(),
            })?;

        Ok(hits
            .into_iter()
            .map(|h| ContextItem::Web {
                title: h.title,
                url: h.url,
                snippet: h.snippet,
            })
            .collect())
    }
}

/// Truncate each item to `item_chars`, then keep the longest ranked prefix
/// that fits `total_chars`. Items are dropped whole, lowest ranked first.
/// Web results whose URL alone exceeds `item_chars` are skipped.
fn apply_budgets(items: Vec<ContextItem>, item_chars: usize, total_chars: usize) -> Vec<ContextItem> {
    let mut kept = Vec::with_capacity(items.len());
    let mut used = 0;
    for mut item in items {
        if !item.truncate_to(item_chars) {
            tracing::debug!(item_chars, "web result dropped, url over item budget");
            continue;
        }
        let cost = item.cost();
        if used + cost > total_chars {
            break;
        }
        used += cost;
        kept.push(item);
    }
    kept
}

/// Cut `text` to at most `max` characters, marking the cut with `…`.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    if max == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.push('…');
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use converse_store::{
        Database, Fact, HashingEmbedder, MessageStatus, NewMessage, PurgeReport, RecordMetadata,
        ScoredRecord, SqliteMemoryStore, StoreError, StoreResult, StoredMessage,
    };

    /// Memory store whose vector queries fail or stall.
    struct BrokenVectors {
        stall: bool,
    }

    #[async_trait]
    impl MemoryStore for BrokenVectors {
        async fn add_vector(&self, _: &str, _: RecordMetadata) -> StoreResult<String> {
            Err(StoreError::InvalidArgument("offline".into()))
        }
        async fn query_vector(&self, _: &str, _: usize, _: Option<&str>) -> StoreResult<Vec<ScoredRecord>> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(StoreError::InvalidArgument("vector index offline".into()))
        }
        async fn soft_delete(&self, _: &str) -> StoreResult<()> {
            Ok(())
        }
        async fn restore(&self, _: &str) -> StoreResult<()> {
            Ok(())
        }
        async fn purge_expired(&self, _: Duration) -> StoreResult<PurgeReport> {
            Ok(PurgeReport::default())
        }
        async fn get_fact(&self, _: &str, _: &str) -> StoreResult<Option<Fact>> {
            Ok(None)
        }
        async fn set_fact(&self, _: &str, _: &str, _: &str) -> StoreResult<Fact> {
            Err(StoreError::InvalidArgument("offline".into()))
        }
        async fn delete_fact(&self, _: &str, _: &str) -> StoreResult<bool> {
            Ok(false)
        }
        async fn list_facts(&self, _: &str) -> StoreResult<Vec<Fact>> {
            Ok(Vec::new())
        }
        async fn append_message(&self, _: &str, _: NewMessage) -> StoreResult<i64> {
            Err(StoreError::InvalidArgument("offline".into()))
        }
        async fn set_message_status(&self, _: i64, _: MessageStatus) -> StoreResult<()> {
            Ok(())
        }
        async fn list_messages(&self, _: &str, _: Option<u32>) -> StoreResult<Vec<StoredMessage>> {
            Ok(Vec::new())
        }
    }

    struct StaticSearch(Vec<SearchHit>);

    #[async_trait]
    impl WebSearch for StaticSearch {
        async fn search(&self, _query: &str, count: usize) -> Result<Vec<SearchHit>, ToolError> {
            Ok(self.0.iter().take(count).cloned().collect())
        }
    }

    struct FailingSearch;

    #[async_trait]
    impl WebSearch for FailingSearch {
        async fn search(&self, _query: &str, _count: usize) -> Result<Vec<SearchHit>, ToolError> {
            Err(ToolError::failed("web_search", "HTTP 503"))
        }
    }

    fn settings() -> RetrievalSettings {
        RetrievalSettings {
            top_k: 3,
            item_chars: 100,
            total_chars: 1000,
            max_distance: 0.99,
            vector_timeout: Duration::from_millis(100),
            search_timeout: Duration::from_millis(100),
            search_results: 5,
        }
    }

    fn hit(n: usize) -> SearchHit {
        SearchHit {
            title: format!("Result {n}"),
            url: format!("https://example.com/{n}"),
            snippet: format!("snippet number {n}"),
        }
    }

    async fn seeded_store() -> Arc<dyn MemoryStore> {
        let db = Database::in_memory_migrated().await.unwrap();
        let store = SqliteMemoryStore::new(db, Arc::new(HashingEmbedder::default()));
        store
            .add_vector("my favourite colour is green", RecordMetadata::new("note"))
            .await
            .unwrap();
        store
            .add_vector("the rust borrow checker", RecordMetadata::new("note"))
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn memory_then_web_ordering() {
        let engine = RetrievalEngine::new(
            seeded_store().await,
            Some(Arc::new(StaticSearch(vec![hit(1), hit(2)]))),
            settings(),
        );
        let bundle = engine
            .retrieve(&RetrievalQuery::new("what is my favourite colour").with_web(true), 1)
            .await;

        assert!(bundle.warnings.is_empty());
        assert_eq!(bundle.items.len(), 3);
        match &bundle.items[0] {
            ContextItem::Memory { text, .. } => assert!(text.contains("green")),
            other => panic!("expected memory first, got {other:?}"),
        }
        assert_eq!(bundle.web().count(), 2);
    }

    #[tokio::test]
    async fn failing_vector_store_degrades_to_warning() {
        let engine = RetrievalEngine::new(
            Arc::new(BrokenVectors { stall: false }),
            Some(Arc::new(StaticSearch(vec![hit(1)]))),
            settings(),
        );
        let bundle = engine
            .retrieve(&RetrievalQuery::new("hello").with_web(true), 3)
            .await;
        assert_eq!(bundle.warnings.len(), 1);
        assert!(bundle.warnings[0].starts_with("Memory unavailable"));
        assert_eq!(bundle.web().count(), 1);
    }

    #[tokio::test]
    async fn stalled_vector_store_times_out() {
        let engine = RetrievalEngine::new(Arc::new(BrokenVectors { stall: true }), None, settings());
        let started = std::time::Instant::now();
        let bundle = engine.retrieve(&RetrievalQuery::new("hello"), 3).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(bundle.is_empty());
        assert!(bundle.warnings[0].contains("timed out"));
    }

    #[tokio::test]
    async fn failing_search_degrades_independently() {
        let engine = RetrievalEngine::new(seeded_store().await, Some(Arc::new(FailingSearch)), settings());
        let bundle = engine
            .retrieve(&RetrievalQuery::new("favourite colour").with_web(true), 2)
            .await;
        assert_eq!(bundle.warnings.len(), 1);
        assert!(bundle.warnings[0].starts_with("Web search unavailable"));
        assert!(bundle.memory().count() >= 1);
    }

    #[tokio::test]
    async fn web_not_requested_skips_search() {
        let engine = RetrievalEngine::new(seeded_store().await, Some(Arc::new(FailingSearch)), settings());
        let bundle = engine.retrieve(&RetrievalQuery::new("colour"), 2).await;
        assert!(bundle.warnings.is_empty());
        assert_eq!(bundle.web().count(), 0);
    }

    #[test]
    fn budgets_truncate_items_and_drop_tail_whole() {
        let items = vec![
            ContextItem::Memory {
                id: "a".into(),
                text: "x".repeat(50),
                distance: 0.1,
            },
            ContextItem::Memory {
                id: "b".into(),
                text: "y".repeat(10),
                distance: 0.2,
            },
            ContextItem::Memory {
                id: "c".into(),
                text: "z".repeat(5),
                distance: 0.3,
            },
        ];
        let kept = apply_budgets(items, 20, 35);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].cost(), 20);
        assert_eq!(kept[1].cost(), 10);
    }

    #[test]
    fn budget_stops_at_first_item_that_does_not_fit() {
        let items = vec![
            ContextItem::Memory {
                id: "a".into(),
                text: "x".repeat(30),
                distance: 0.1,
            },
            ContextItem::Memory {
                id: "b".into(),
                text: "y".repeat(30),
                distance: 0.2,
            },
            ContextItem::Memory {
                id: "c".into(),
                text: "z".repeat(2),
                distance: 0.3,
            },
        ];
        let kept = apply_budgets(items, 100, 40);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn web_items_stay_within_the_item_budget() {
        let items = vec![
            ContextItem::Web {
                title: "A long page title".into(),
                url: format!("https://example.com/{}", "p".repeat(300)),
                snippet: "s".repeat(300),
            },
            ContextItem::Web {
                title: "Short".into(),
                url: "https://example.com/a".into(),
                snippet: "s".repeat(300),
            },
        ];
        let kept = apply_budgets(items, 100, 1000);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].cost(), 100);
        match &kept[0] {
            ContextItem::Web { title, url, snippet } => {
                assert_eq!(title, "Short");
                assert_eq!(url, "https://example.com/a");
                assert!(snippet.ends_with('…'));
            }
            other => panic!("expected web item, got {other:?}"),
        }
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate_chars("abcdef", 4), "abc…");
        assert_eq!(truncate_chars("abc", 4), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }
}
