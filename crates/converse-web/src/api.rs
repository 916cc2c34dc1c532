//! REST API route handlers.
//!
//! Provides endpoints for health and status, one-shot chat, conversation
//! history and trash, memory records, facts, tool discovery and session
//! provider preferences.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use converse_adapters::DEFAULT_FACT_OWNER;
use converse_agent::{
    BusyPolicy, ErrorKind, Mode, ProviderTarget, ToolDescriptor, TurnEvent, TurnRequest, Usage,
};
use converse_store::{
    Conversation, Fact, MemoryRecord, MemoryStore, PurgeReport, ScoredRecord, StoredMessage,
};

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

const MAX_PAGE: u32 = 200;
const MAX_TOP_K: usize = 50;

/// `?limit=&offset=` paging parameters.
#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    20
}

impl Page {
    fn limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE)
    }
}

// ---------------------------------------------------------------------------
// GET /api/health, GET /api/status
// ---------------------------------------------------------------------------

/// Liveness plus a database round trip.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.database().ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => {
            tracing::warn!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "reason": e.to_string()})),
            )
        }
    }
}

/// Response payload for the `/api/status` endpoint.
#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub default_target: ProviderTarget,
    pub default_tier: String,
    pub providers: Vec<String>,
    pub tools: usize,
    pub active_sessions: usize,
    pub pending_writes: usize,
    pub store: StoreStatus,
}

/// Database reachability and row counts.
#[derive(Serialize)]
pub struct StoreStatus {
    pub reachable: bool,
    pub messages: Option<i64>,
    pub memory_records: Option<i64>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let reachable = state.store.database().ping().await.is_ok();
    let messages = state.conversations().message_count().await.ok();
    let memory_records = state.store.vectors().count().await.ok();
    let orchestrator = &state.orchestrator;

    Json(StatusResponse {
        status: if reachable { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        default_target: state.config.default_target(),
        default_tier: state.config.router.default_tier.clone(),
        providers: orchestrator.router().provider_ids(),
        tools: orchestrator.registry().len(),
        active_sessions: orchestrator.sessions().active_sessions().len(),
        pending_writes: orchestrator.pending_writes(),
        store: StoreStatus {
            reachable,
            messages,
            memory_records,
        },
    })
}

// ---------------------------------------------------------------------------
// POST /api/chat
// ---------------------------------------------------------------------------

/// Request body for the one-shot chat endpoint.
#[derive(Debug, Deserialize)]
pub struct ChatBody {
    /// Session to continue; a fresh one is created when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// Cancel a running reply in the same session instead of failing.
    #[serde(default)]
    pub interrupt: bool,
}

/// A completed turn.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub turn_id: Uuid,
    pub text: String,
    pub served_by: ProviderTarget,
    pub usage: Usage,
    pub durable: bool,
    /// `info` messages raised during the turn.
    pub notices: Vec<String>,
    /// `tool_finished` events of a deep-research turn.
    pub tools: Vec<TurnEvent>,
}

/// Run one turn to completion and return the full reply.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> ApiResult<ChatResponse> {
    let session_id = body
        .session_id
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    state.restore_preference(&session_id).await;

    let mut request = TurnRequest::new(&session_id, body.message).with_mode(body.mode);
    request.provider = body.provider;
    request.model = body.model;
    request.language = body.language;
    if body.interrupt {
        request.busy_policy = Some(BusyPolicy::Preempt);
    }

    let stream = state.orchestrator.handle(request).await?;
    let turn_id = stream.turn_id();
    let mut notices = Vec::new();
    let mut tools = Vec::new();

    for event in stream.collect_events().await {
        match event {
            TurnEvent::Info { message, .. } => notices.push(message),
            TurnEvent::ToolFinished { .. } => tools.push(event),
            TurnEvent::Complete {
                text,
                served_by,
                usage,
                durable,
                ..
            } => {
                return Ok(Json(ChatResponse {
                    session_id,
                    turn_id,
                    text,
                    served_by,
                    usage,
                    durable,
                    notices,
                    tools,
                }));
            }
            TurnEvent::Error { kind, reason, .. } => {
                return Err(ApiError::new(ApiError::status_for(kind), kind, reason));
            }
            TurnEvent::Cancelled { .. } => {
                return Err(ApiError::new(
                    StatusCode::CONFLICT,
                    ErrorKind::Cancelled,
                    "the reply was cancelled",
                ));
            }
            _ => {}
        }
    }

    tracing::error!(%session_id, %turn_id, "turn stream ended without a terminal event");
    Err(ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Internal,
        "turn ended without a result",
    ))
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// GET /api/history -- live conversations, most recently updated first.
pub async fn list_history(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Page>,
) -> ApiResult<Vec<Conversation>> {
    Ok(Json(state.conversations().list(page.limit(), page.offset).await?))
}

#[derive(Serialize)]
pub struct HistoryDetail {
    pub conversation: Conversation,
    pub messages: Vec<StoredMessage>,
}

/// GET /api/history/{id} -- one conversation with its messages.
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<HistoryDetail> {
    let conversation = state.conversations().get(&id).await?;
    let messages = state.conversations().messages(&id, None).await?;
    Ok(Json(HistoryDetail {
        conversation,
        messages,
    }))
}

/// DELETE /api/history/{id} -- move a conversation to the trash.
pub async fn delete_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.conversations().trash(&id).await?;
    Ok(Json(json!({"id": id, "trashed": true})))
}

// ---------------------------------------------------------------------------
// Trash
// ---------------------------------------------------------------------------

pub async fn list_trash(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Conversation>> {
    Ok(Json(state.conversations().list_trash().await?))
}

/// POST /api/trash/{id}/restore -- idempotent; `restored` is `false` when
/// the conversation was not in the trash.
pub async fn restore_trash(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let restored = state.conversations().restore(&id).await?;
    Ok(Json(json!({"id": id, "restored": restored})))
}

/// DELETE /api/trash/{id} -- permanently remove one trashed conversation.
pub async fn purge_trash(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.conversations().purge(&id).await?;
    Ok(Json(json!({"id": id, "purged": true})))
}

/// DELETE /api/trash/empty
pub async fn empty_trash(State(state): State<Arc<AppState>>) -> ApiResult<Value> {
    let purged = state.conversations().empty_trash().await?;
    Ok(Json(json!({"purged": purged})))
}

/// POST /api/trash/purge-expired -- drop trashed conversations and memory
/// records older than the retention window.
pub async fn purge_expired(State(state): State<Arc<AppState>>) -> ApiResult<PurgeReport> {
    let report = state.store.purge_expired(state.config.retention()).await?;
    tracing::info!(
        conversations = report.conversations,
        memory_records = report.memory_records,
        "expired trash purged"
    );
    Ok(Json(report))
}

// ---------------------------------------------------------------------------
// Memory records
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MemoryPage {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    /// Include soft-deleted records.
    #[serde(default)]
    pub deleted: bool,
}

/// GET /api/memory
pub async fn list_memory(
    State(state): State<Arc<AppState>>,
    Query(page): Query<MemoryPage>,
) -> ApiResult<Vec<MemoryRecord>> {
    let limit = page.limit.clamp(1, MAX_PAGE);
    Ok(Json(
        state.store.vectors().list(limit, page.offset, page.deleted).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct MemorySearch {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub owner: Option<String>,
}

/// GET /api/memory/search?q=&top_k=
pub async fn search_memory(
    State(state): State<Arc<AppState>>,
    Query(search): Query<MemorySearch>,
) -> ApiResult<Vec<ScoredRecord>> {
    let q = search.q.trim();
    if q.is_empty() {
        return Err(ApiError::bad_request("query parameter `q` must not be empty"));
    }
    let top_k = search
        .top_k
        .unwrap_or(state.config.retrieval.top_k)
        .clamp(1, MAX_TOP_K);
    let owner = search.owner.as_deref().filter(|o| !o.is_empty());
    Ok(Json(state.store.query_vector(q, top_k, owner).await?))
}

/// DELETE /api/memory/{id} -- soft delete.
pub async fn delete_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.store.soft_delete(&id).await?;
    Ok(Json(json!({"id": id, "deleted": true})))
}

/// POST /api/memory/{id}/restore
pub async fn restore_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.store.restore(&id).await?;
    Ok(Json(json!({"id": id, "restored": true})))
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    #[serde(default)]
    pub owner: Option<String>,
}

impl OwnerQuery {
    fn owner(&self) -> &str {
        self.owner
            .as_deref()
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .unwrap_or(DEFAULT_FACT_OWNER)
    }
}

#[derive(Debug, Deserialize)]
pub struct FactBody {
    pub value: String,
}

/// GET /api/facts?owner=
pub async fn list_facts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Vec<Fact>> {
    Ok(Json(state.store.list_facts(query.owner()).await?))
}

/// PUT /api/facts/{key}
pub async fn put_fact(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<OwnerQuery>,
    Json(body): Json<FactBody>,
) -> ApiResult<Fact> {
    let value = body.value.trim();
    if value.is_empty() {
        return Err(ApiError::bad_request("fact value must not be empty"));
    }
    Ok(Json(state.store.set_fact(query.owner(), &key, value).await?))
}

/// DELETE /api/facts/{key}
pub async fn delete_fact(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Value> {
    if !state.store.delete_fact(query.owner(), &key).await? {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            ErrorKind::Persistence,
            format!("fact not found: {key}"),
        ));
    }
    Ok(Json(json!({"key": key, "deleted": true})))
}

// ---------------------------------------------------------------------------
// GET /api/tools
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TierQuery {
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Serialize)]
pub struct ToolsResponse {
    pub tier: String,
    pub tools: Vec<ToolDescriptor>,
}

/// Tools registered and allowed for a plan tier (the default tier when
/// none is given).
pub async fn tools(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TierQuery>,
) -> Json<ToolsResponse> {
    let tier = query
        .tier
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| state.config.router.default_tier.clone());
    let tools = state
        .orchestrator
        .registry()
        .descriptors(|name| state.config.tier_allows_tool(&tier, name));
    Json(ToolsResponse { tier, tools })
}

// ---------------------------------------------------------------------------
// PUT /api/sessions/{id}/provider
// ---------------------------------------------------------------------------

/// Both fields empty clears the preference.
#[derive(Debug, Deserialize)]
pub struct ProviderBody {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PreferenceResponse {
    pub session_id: String,
    pub preference: Option<ProviderTarget>,
}

pub async fn set_session_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ProviderBody>,
) -> ApiResult<PreferenceResponse> {
    let provider = body.provider.map(|p| p.trim().to_owned()).filter(|p| !p.is_empty());
    let model = body.model.map(|m| m.trim().to_owned()).filter(|m| !m.is_empty());

    let target = match (provider, model) {
        (None, None) => None,
        (Some(provider), Some(model)) => Some(ProviderTarget::new(provider, model)),
        (Some(provider), None) => {
            let model = state
                .config
                .provider(&provider)
                .and_then(|p| p.models.first().cloned())
                .ok_or_else(|| {
                    ApiError::bad_request(format!("provider `{provider}` has no default model"))
                })?;
            Some(ProviderTarget::new(provider, model))
        }
        (None, Some(model)) => {
            let provider = state
                .orchestrator
                .sessions()
                .preference(&id)
                .map(|t| t.provider)
                .unwrap_or_else(|| state.config.router.default_provider.clone());
            Some(ProviderTarget::new(provider, model))
        }
    };

    state.orchestrator.set_preference(&id, target.clone())?;
    state
        .conversations()
        .set_preferences(
            &id,
            target.as_ref().map(|t| t.provider.as_str()),
            target.as_ref().map(|t| t.model.as_str()),
        )
        .await?;
    tracing::info!(
        session_id = %id,
        target = %target.as_ref().map(ToString::to_string).unwrap_or_default(),
        "session preference updated"
    );

    Ok(Json(PreferenceResponse {
        session_id: id,
        preference: target,
    }))
}
