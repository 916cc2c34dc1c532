//! Conversation orchestrator.
//!
//! [`Orchestrator::handle`] validates a request, claims the session's single
//! turn slot and returns a [`TurnStream`] immediately; the turn itself runs
//! on a spawned task:
//!
//! 1. persist the user message (`pending`) and capture quick facts,
//! 2. gather history, facts and a bounded-time retrieval bundle,
//! 3. in `deep_research`, plan and execute tools,
//! 4. stream the generation through the Provider Router,
//! 5. persist the outcome, release the session, emit the terminal event and
//!    index the exchange in the background.
//!
//! Store writes that fail are queued in order, per session, and retried by
//! [`Orchestrator::reconcile`]; the turn is then reported with
//! `durable: false`. No lock is held across a store call, so a slow store on
//! one session never holds up another.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use converse_store::{
    KIND_CONVERSATION, MemoryStore, MessageRole, MessageStatus, NewMessage, RecordMetadata,
    StoreError,
};
use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{AgentError, Result};
use crate::executor::PlanExecutor;
use crate::guard::InputGuard;
use crate::llm::router::{Generation, ProviderRouter, RouteRequest};
use crate::llm::types::ProviderTarget;
use crate::planner::Planner;
use crate::prompt::{FactCapture, PromptBuilder, PromptInput};
use crate::retrieval::{
    ContextBundle, ContextItem, RetrievalEngine, RetrievalQuery, RetrievalSettings, WebSearch,
};
use crate::session::{GenerationState, SessionManager, TurnGuard};
use crate::tools::ToolRegistry;
use crate::turn::{Mode, TurnEvent, TurnRequest};

const EVENT_BUFFER: usize = 256;
const CHUNK_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// Events of one accepted turn. Dropping the stream cancels the turn.
#[derive(Debug)]
pub struct TurnStream {
    turn_id: Uuid,
    session_id: String,
    rx: mpsc::Receiver<TurnEvent>,
}

impl TurnStream {
    pub fn turn_id(&self) -> Uuid {
        self.turn_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Drain the stream up to and including the terminal event.
    pub async fn collect_events(mut self) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
        events
    }
}

impl Stream for TurnStream {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ---------------------------------------------------------------------------
// Reconciliation queue
// ---------------------------------------------------------------------------

/// A store write that has not reached the store yet.
#[derive(Debug, Clone)]
enum PendingWrite {
    Append {
        session_id: String,
        message: NewMessage,
    },
    Status {
        session_id: String,
        message_id: i64,
        status: MessageStatus,
    },
}

impl PendingWrite {
    fn session_id(&self) -> &str {
        match self {
            Self::Append { session_id, .. } | Self::Status { session_id, .. } => session_id,
        }
    }
}

/// Outcome of one [`Orchestrator::reconcile`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub written: usize,
    pub remaining: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Inner {
    config: Arc<AppConfig>,
    store: Arc<dyn MemoryStore>,
    router: Arc<ProviderRouter>,
    retrieval: RetrievalEngine,
    planner: Planner,
    executor: PlanExecutor,
    sessions: SessionManager,
    guard: InputGuard,
    capture: FactCapture,
    prompts: PromptBuilder,
    /// Writes waiting for the store, keyed by session, oldest first.
    pending: DashMap<String, VecDeque<PendingWrite>>,
    /// Serializes reconciliation passes; turns never take it.
    reconciling: Mutex<()>,
}

/// Entry point for conversation turns. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.inner.router.provider_ids())
            .field("tools", &self.inner.executor.registry().names())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

/// Fully resolved inputs of one turn.
struct TurnPlan {
    session_id: String,
    owner: String,
    text: String,
    mode: Mode,
    language: Option<String>,
    target: ProviderTarget,
    tier: String,
    notices: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn MemoryStore>,
        router: Arc<ProviderRouter>,
        registry: Arc<ToolRegistry>,
        search: Option<Arc<dyn WebSearch>>,
    ) -> Result<Self> {
        let retrieval = RetrievalEngine::new(
            Arc::clone(&store),
            search,
            RetrievalSettings::from_config(&config),
        );
        let inner = Inner {
            guard: InputGuard::new(config.session.max_input_chars)?,
            capture: FactCapture::new()?,
            prompts: PromptBuilder::new(config.session.history_turns),
            planner: Planner::new(Arc::clone(&router)),
            executor: PlanExecutor::new(registry, config.tool_timeout()),
            sessions: SessionManager::new(),
            pending: DashMap::new(),
            reconciling: Mutex::new(()),
            retrieval,
            config,
            store,
            router,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.inner.store
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.inner.router
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.inner.executor.registry()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Accept one turn and return its event stream.
    ///
    /// Policy problems (empty input, disallowed target, busy session) fail
    /// here, before anything is persisted.
    pub async fn handle(&self, request: TurnRequest) -> Result<TurnStream> {
        let session_id = request.session_id.trim().to_owned();
        if session_id.is_empty() {
            return Err(AgentError::InvalidRequest {
                reason: "session id must not be empty".into(),
            });
        }

        let guarded = self.inner.guard.sanitize(&request.message)?;
        let tier = request
            .tier
            .clone()
            .unwrap_or_else(|| self.inner.config.router.default_tier.clone());
        let requested = self.resolve_target(&session_id, &request)?;
        let target = self.inner.router.check(requested.as_ref(), Some(&tier))?;

        let mut notices = Vec::new();
        if guarded.filtered > 0 {
            notices.push("Some instructions in your message were filtered.".to_owned());
        }
        if guarded.truncated {
            notices.push(format!(
                "Your message was shortened to {} characters.",
                self.inner.config.session.max_input_chars
            ));
        }

        let policy = request
            .busy_policy
            .unwrap_or(self.inner.config.session.busy_policy);
        let guard = self.inner.sessions.begin_turn(&session_id, policy).await?;
        let turn_id = guard.turn_id();

        let plan = TurnPlan {
            owner: request.owner().trim().to_owned(),
            session_id: session_id.clone(),
            text: guarded.text,
            mode: request.mode,
            language: request.language.filter(|l| !l.trim().is_empty()),
            target,
            tier,
            notices,
        };

        tracing::info!(
            session_id = %plan.session_id,
            %turn_id,
            mode = %plan.mode,
            target = %plan.target,
            "turn accepted"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = tracing::info_span!("turn", session_id = %session_id, %turn_id);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_turn(plan, guard, tx).await }.instrument(span));

        Ok(TurnStream {
            turn_id,
            session_id,
            rx,
        })
    }

    /// Explicit provider/model first, then the session preference.
    fn resolve_target(
        &self,
        session_id: &str,
        request: &TurnRequest,
    ) -> Result<Option<ProviderTarget>> {
        let provider = request.provider.as_deref().map(str::trim).filter(|p| !p.is_empty());
        let model = request.model.as_deref().map(str::trim).filter(|m| !m.is_empty());
        match (provider, model) {
            (Some(provider), Some(model)) => Ok(Some(ProviderTarget::new(provider, model))),
            (Some(provider), None) => {
                let config = self
                    .inner
                    .config
                    .provider(provider)
                    .ok_or_else(|| AgentError::UnknownProvider {
                        provider: provider.to_owned(),
                    })?;
                let model = config.models.first().ok_or_else(|| AgentError::InvalidRequest {
                    reason: format!("provider `{provider}` has no default model"),
                })?;
                Ok(Some(ProviderTarget::new(provider, model.clone())))
            }
            (None, Some(model)) => {
                let provider = self
                    .inner
                    .sessions
                    .preference(session_id)
                    .map(|t| t.provider)
                    .unwrap_or_else(|| self.inner.config.router.default_provider.clone());
                Ok(Some(ProviderTarget::new(provider, model)))
            }
            (None, None) => Ok(self.inner.sessions.preference(session_id)),
        }
    }

    /// Cancel the active turn of a session.
    pub fn cancel(&self, session_id: &str) -> bool {
        let cancelled = self.inner.sessions.cancel(session_id);
        if cancelled {
            tracing::info!(session_id, "turn cancelled by request");
        }
        cancelled
    }

    /// Cancel any active turn and drop the session's in-memory state.
    ///
    /// The session stays busy until a cancelled turn has settled its
    /// messages, so a new turn never overlaps the old one.
    pub fn close_session(&self, session_id: &str) {
        self.inner.sessions.remove(session_id);
    }

    /// Set (or clear) the provider/model used by later turns of a session.
    pub fn set_preference(&self, session_id: &str, target: Option<ProviderTarget>) -> Result<()> {
        if let Some(target) = &target {
            self.inner.router.check(Some(target), None)?;
        }
        self.inner.sessions.set_preference(session_id, target);
        Ok(())
    }

    /// Flip the voice-capture toggle. Returns the `info` event to show.
    pub fn voice_toggle(&self, session_id: &str, on: bool) -> TurnEvent {
        self.inner.sessions.set_voice(session_id, on);
        TurnEvent::Info {
            turn_id: None,
            message: if on {
                "Microphone armed.".to_owned()
            } else {
                "Microphone disarmed.".to_owned()
            },
        }
    }

    pub fn state(&self, session_id: &str) -> GenerationState {
        self.inner.sessions.state(session_id)
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.pending.iter().map(|entry| entry.len()).sum()
    }

    /// Retry queued store writes in order. A failing session keeps its
    /// remaining writes queued; other sessions still make progress.
    ///
    /// A write leaves its queue only after it reached the store, so a turn
    /// running meanwhile keeps queueing behind it.
    pub async fn reconcile(&self) -> ReconcileReport {
        let _pass = self.inner.reconciling.lock().await;
        let sessions: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut written = 0;
        for session_id in sessions {
            while let Some(write) = self.inner.front_pending(&session_id) {
                match self.inner.apply(&write).await {
                    Ok(()) => {
                        written += 1;
                        self.inner.pop_pending(&session_id);
                    }
                    Err(e) => {
                        tracing::warn!(%session_id, error = %e, "reconciliation write failed");
                        break;
                    }
                }
            }
        }

        let report = ReconcileReport {
            written,
            remaining: self.pending_writes(),
        };
        if report.written > 0 || report.remaining > 0 {
            tracing::info!(written = report.written, remaining = report.remaining, "reconciliation pass");
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Turn execution
// ---------------------------------------------------------------------------

/// Where a generation ended up.
enum Outcome {
    Complete(Generation),
    Failed(AgentError),
    Cancelled,
}

impl Inner {
    async fn run_turn(&self, plan: TurnPlan, guard: TurnGuard, tx: mpsc::Sender<TurnEvent>) {
        let turn_id = guard.turn_id();
        let cancel = guard.cancel_token();
        emit(&tx, &cancel, TurnEvent::Thinking { turn_id, mode: plan.mode }).await;
        for notice in &plan.notices {
            info(&tx, &cancel, turn_id, notice.clone()).await;
        }

        let mut durable = true;
        let user_message = NewMessage::user(plan.text.clone()).with_metadata(json!({
            "turn_id": turn_id,
            "mode": plan.mode,
            "language": plan.language,
        }));
        let user_id = self
            .write_append(
                &plan.session_id,
                user_message.clone().with_status(MessageStatus::Pending),
                false,
            )
            .await;
        if user_id.is_none() {
            durable = false;
        }

        let mut partial = String::new();
        let outcome = match self
            .generate(&plan, &guard, &tx, &cancel, user_id, &mut partial)
            .await
        {
            Ok(generation) => Outcome::Complete(generation),
            Err(AgentError::Cancelled) => Outcome::Cancelled,
            Err(_) if cancel.is_cancelled() => Outcome::Cancelled,
            Err(e) => Outcome::Failed(e),
        };

        // Persist before releasing the session so a preempting turn sees a
        // settled log.
        let user_status = match &outcome {
            Outcome::Complete(_) => MessageStatus::Complete,
            Outcome::Failed(_) => MessageStatus::Error,
            Outcome::Cancelled => MessageStatus::Cancelled,
        };
        durable &= self
            .settle_user(&plan.session_id, user_id, user_message, user_status)
            .await;

        let assistant = match &outcome {
            Outcome::Complete(generation) => Some(
                NewMessage::assistant(generation.text.clone()).with_metadata(json!({
                    "turn_id": turn_id,
                    "mode": plan.mode,
                    "language": plan.language,
                    "provider": generation.served_by.provider,
                    "model": generation.served_by.model,
                    "usage": generation.usage,
                    "attempts": generation.attempts,
                    "fell_back": generation.fell_back,
                })),
            ),
            _ if partial.is_empty() => None,
            Outcome::Failed(e) => Some(
                NewMessage::assistant(partial.clone())
                    .with_status(MessageStatus::Error)
                    .with_metadata(json!({
                        "turn_id": turn_id,
                        "mode": plan.mode,
                        "error_kind": e.kind(),
                        "error": e.to_string(),
                    })),
            ),
            Outcome::Cancelled => Some(
                NewMessage::assistant(partial.clone())
                    .with_status(MessageStatus::Cancelled)
                    .with_metadata(json!({"turn_id": turn_id, "mode": plan.mode})),
            ),
        };
        if let Some(message) = assistant {
            durable &= self
                .write_append(&plan.session_id, message, true)
                .await
                .is_some();
        }

        let (state, event) = match outcome {
            Outcome::Complete(generation) => {
                tracing::info!(
                    served_by = %generation.served_by,
                    attempts = generation.attempts,
                    fell_back = generation.fell_back,
                    output_tokens = generation.usage.output_tokens,
                    durable,
                    "turn complete"
                );
                self.index_exchange(&plan, turn_id, &generation.text);
                (
                    GenerationState::Complete,
                    TurnEvent::Complete {
                        turn_id,
                        text: generation.text,
                        served_by: generation.served_by,
                        usage: generation.usage,
                        durable,
                    },
                )
            }
            Outcome::Failed(e) => {
                tracing::warn!(kind = %e.kind(), error = %e, "turn failed");
                (
                    GenerationState::Error,
                    TurnEvent::Error {
                        turn_id,
                        kind: e.kind(),
                        reason: e.to_string(),
                        partial,
                    },
                )
            }
            Outcome::Cancelled => {
                tracing::info!(partial_chars = partial.chars().count(), "turn cancelled");
                (
                    GenerationState::Cancelled,
                    TurnEvent::Cancelled { turn_id, partial },
                )
            }
        };

        guard.finish(state);
        // The receiver may be gone already; the outcome is persisted either way.
        let _ = tx.send(event).await;
    }

    /// Everything between the user message and the finished generation.
    async fn generate(
        &self,
        plan: &TurnPlan,
        guard: &TurnGuard,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
        user_id: Option<i64>,
        partial: &mut String,
    ) -> Result<Generation> {
        let turn_id = guard.turn_id();
        self.capture_facts(plan, tx, cancel, turn_id).await;

        let history = match self
            .store
            .list_messages(
                &plan.session_id,
                Some(self.config.session.history_turns.saturating_mul(4) + 2),
            )
            .await
        {
            Ok(mut messages) => {
                if let Some(id) = user_id {
                    messages.retain(|m| m.id != id);
                }
                messages
            }
            Err(e) => {
                tracing::warn!(error = %e, "history unavailable");
                Vec::new()
            }
        };
        let recent: Vec<String> = history
            .iter()
            .rev()
            .filter(|m| m.role == MessageRole::User && m.status == MessageStatus::Complete)
            .take(2)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        let wants_memory = plan.mode != Mode::Plain || self.config.retrieval.memory_in_plain;
        let wants_web = plan.mode.wants_web();
        if wants_web && !self.retrieval.has_search() {
            info(tx, cancel, turn_id, "Web search is not configured; answering from memory.".into()).await;
        }
        let query = RetrievalQuery::new(plan.text.clone())
            .with_memory(wants_memory)
            .with_web(wants_web)
            .with_recent(recent)
            .with_owner(plan.owner.clone());
        let bundle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            bundle = self.retrieval.retrieve(&query, self.config.retrieval.top_k) => bundle,
        };
        for warning in &bundle.warnings {
            info(tx, cancel, turn_id, warning.clone()).await;
        }

        let facts = match self.store.list_facts(&plan.owner).await {
            Ok(facts) => facts,
            Err(e) => {
                tracing::warn!(error = %e, "facts unavailable");
                Vec::new()
            }
        };

        let mut findings = None;
        let mut synthesis = None;
        if plan.mode == Mode::DeepResearch {
            let (f, s) = self.research(plan, &bundle, tx, cancel, turn_id).await?;
            findings = Some(f);
            synthesis = Some(s);
        }

        let mut input = PromptInput::new(&plan.text, plan.mode, &bundle);
        input.language = plan.language.as_deref();
        input.facts = &facts;
        input.history = &history;
        input.findings = findings.as_deref();
        input.synthesis = synthesis.as_deref();
        let request = RouteRequest {
            messages: self.prompts.build(&input),
            target: Some(plan.target.clone()),
            tier: Some(plan.tier.clone()),
            temperature: None,
        };

        self.stream(&request, guard, tx, cancel, partial).await
    }

    /// Run the router and relay chunks as `token` events.
    async fn stream(
        &self,
        request: &RouteRequest,
        guard: &TurnGuard,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
        partial: &mut String,
    ) -> Result<Generation> {
        let turn_id = guard.turn_id();
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(CHUNK_BUFFER);
        let router = Arc::clone(&self.router);

        let call = async move {
            let result = router.generate(request, &chunk_tx, cancel).await;
            drop(chunk_tx);
            result
        };
        let relay = async {
            while let Some(chunk) = chunk_rx.recv().await {
                if cancel.is_cancelled() {
                    break;
                }
                if partial.is_empty() {
                    guard.mark_streaming();
                }
                partial.push_str(&chunk);
                let event = TurnEvent::Token {
                    turn_id,
                    text: chunk,
                };
                if tx.send(event).await.is_err() {
                    tracing::debug!("event receiver dropped, cancelling turn");
                    cancel.cancel();
                    break;
                }
            }
            // Closing the receiver makes a still-running provider stop.
            chunk_rx.close();
        };

        let (result, ()) = tokio::join!(call, relay);
        result
    }

    /// Plan and execute tools; returns (findings, synthesis instruction).
    async fn research(
        &self,
        plan: &TurnPlan,
        bundle: &ContextBundle,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
        turn_id: Uuid,
    ) -> Result<(String, String)> {
        let allowed = |tool: &str| self.config.tier_allows_tool(&plan.tier, tool);
        let tools = self.executor.registry().descriptors(allowed);
        let research_plan = self
            .planner
            .plan(
                &plan.text,
                &tools,
                Some(&context_digest(bundle)),
                Some(plan.target.clone()),
                Some(plan.tier.clone()),
                cancel,
            )
            .await?;
        if tools.is_empty() {
            tracing::info!(tier = %plan.tier, "no research tools for tier");
            info(tx, cancel, turn_id, "No research tools are available on your plan; answering directly.".into()).await;
        } else if let Some(reason) = &research_plan.degraded {
            tracing::info!(reason = %reason, "research plan degraded");
            info(tx, cancel, turn_id, "Could not build a research plan; answering directly.".into()).await;
        }

        let report = self
            .executor
            .execute(&research_plan, allowed, tx, turn_id, cancel)
            .await?;
        tracing::info!(
            plan_id = %research_plan.id,
            steps = research_plan.steps.len(),
            completed = report.completed(),
            aborted_at = ?report.aborted_at,
            "research plan executed"
        );
        Ok((report.findings(), research_plan.synthesis))
    }

    async fn capture_facts(
        &self,
        plan: &TurnPlan,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
        turn_id: Uuid,
    ) {
        for fact in self.capture.capture(&plan.text, Utc::now()) {
            let message = match self.store.set_fact(&plan.owner, &fact.key, &fact.value).await {
                Ok(_) if fact.key == "name" => format!("Nice to meet you, {}! I'll remember your name.", fact.value),
                Ok(_) => "Got it, I'll remember that.".to_owned(),
                Err(e) => {
                    tracing::warn!(key = %fact.key, error = %e, "quick fact not saved");
                    "I couldn't save that to memory right now.".to_owned()
                }
            };
            info(tx, cancel, turn_id, message).await;
        }
    }

    /// Add the finished exchange to the vector index off the turn's path.
    fn index_exchange(&self, plan: &TurnPlan, turn_id: Uuid, answer: &str) {
        if answer.trim().is_empty() {
            return;
        }
        let store = Arc::clone(&self.store);
        let user = plan.text.clone();
        let answer = answer.to_owned();
        let metadata = RecordMetadata::new(KIND_CONVERSATION)
            .owner(plan.owner.clone())
            .session(plan.session_id.clone())
            .extra(json!({"turn_id": turn_id, "mode": plan.mode}));
        tokio::spawn(
            async move {
                match store.add_conversation(&user, &answer, metadata).await {
                    Ok(id) => tracing::debug!(record_id = %id, "exchange indexed"),
                    Err(e) => tracing::warn!(error = %e, "exchange not indexed"),
                }
            }
            .in_current_span(),
        );
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Append directly unless the session already has queued writes, in
    /// which case (or on failure) the message joins the queue behind them.
    /// Returns the message id when it reached the store.
    ///
    /// The session's single active turn is the only producer for its queue,
    /// so an empty queue stays empty for the duration of the direct write.
    async fn write_append(&self, session_id: &str, message: NewMessage, queue_on_failure: bool) -> Option<i64> {
        if self.has_pending(session_id) {
            if queue_on_failure {
                self.enqueue(PendingWrite::Append {
                    session_id: session_id.to_owned(),
                    message,
                });
            }
            return None;
        }
        match self.store.append_message(session_id, message.clone()).await {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(session_id, role = %message.role.as_str(), error = %e, "message not persisted, queued");
                if queue_on_failure {
                    self.enqueue(PendingWrite::Append {
                        session_id: session_id.to_owned(),
                        message,
                    });
                }
                None
            }
        }
    }

    fn has_pending(&self, session_id: &str) -> bool {
        self.pending
            .get(session_id)
            .is_some_and(|queue| !queue.is_empty())
    }

    fn enqueue(&self, write: PendingWrite) {
        self.pending
            .entry(write.session_id().to_owned())
            .or_default()
            .push_back(write);
    }

    fn front_pending(&self, session_id: &str) -> Option<PendingWrite> {
        self.pending
            .get(session_id)
            .and_then(|queue| queue.front().cloned())
    }

    fn pop_pending(&self, session_id: &str) {
        if let Some(mut queue) = self.pending.get_mut(session_id) {
            queue.pop_front();
        }
        self.pending.remove_if(session_id, |_, queue| queue.is_empty());
    }

    /// Give the user message its final status, appending it now if the
    /// first write did not land.
    async fn settle_user(
        &self,
        session_id: &str,
        user_id: Option<i64>,
        message: NewMessage,
        status: MessageStatus,
    ) -> bool {
        let Some(id) = user_id else {
            return self
                .write_append(session_id, message.with_status(status), true)
                .await
                .is_some();
        };
        match self.store.set_message_status(id, status).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session_id, message_id = id, error = %e, "status not persisted, queued");
                self.enqueue(PendingWrite::Status {
                    session_id: session_id.to_owned(),
                    message_id: id,
                    status,
                });
                false
            }
        }
    }

    async fn apply(&self, write: &PendingWrite) -> std::result::Result<(), StoreError> {
        match write {
            PendingWrite::Append {
                session_id,
                message,
            } => self
                .store
                .append_message(session_id, message.clone())
                .await
                .map(|_| ()),
            PendingWrite::Status {
                message_id, status, ..
            } => self.store.set_message_status(*message_id, *status).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Send an event; a vanished receiver cancels the turn.
async fn emit(tx: &mpsc::Sender<TurnEvent>, cancel: &CancellationToken, event: TurnEvent) {
    if tx.send(event).await.is_err() {
        cancel.cancel();
    }
}

async fn info(tx: &mpsc::Sender<TurnEvent>, cancel: &CancellationToken, turn_id: Uuid, message: String) {
    emit(
        tx,
        cancel,
        TurnEvent::Info {
            turn_id: Some(turn_id),
            message,
        },
    )
    .await;
}

/// Short text form of a bundle for the planner.
fn context_digest(bundle: &ContextBundle) -> String {
    bundle
        .items
        .iter()
        .map(|item| match item {
            ContextItem::Memory { text, .. } => format!("- memory: {}", text.replace('\n', " ")),
            ContextItem::Web { title, url, .. } => format!("- web: {title} ({url})"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_lists_items() {
        let bundle = ContextBundle {
            items: vec![
                ContextItem::Memory {
                    id: "1".into(),
                    text: "User: a\nAssistant: b".into(),
                    distance: 0.2,
                },
                ContextItem::Web {
                    title: "T".into(),
                    url: "https://t.example".into(),
                    snippet: "s".into(),
                },
            ],
            warnings: vec![],
        };
        assert_eq!(
            context_digest(&bundle),
            "- memory: User: a Assistant: b\n- web: T (https://t.example)"
        );
    }

    #[test]
    fn pending_write_session() {
        let write = PendingWrite::Status {
            session_id: "s".into(),
            message_id: 1,
            status: MessageStatus::Complete,
        };
        assert_eq!(write.session_id(), "s");
    }
}
