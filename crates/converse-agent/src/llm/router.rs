//! Provider router.
//!
//! One retry/fallback policy for every backend: a call goes to the requested
//! (or default) target, is retried against the same provider on transient
//! failures, and then walks the configured fallback chain, each target once.
//! A plan-tier allow-list gates every target. Retries never happen once text
//! has reached the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, PlanConfig};
use crate::error::{AgentError, Result};
use crate::llm::provider::Provider;
use crate::llm::types::{ChatRequest, Message, ProviderTarget, StreamOutcome, Usage};

/// Capacity of the per-attempt chunk channel.
const CHUNK_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Retry and backoff parameters shared by all providers.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts against the primary target (initial + retries).
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    /// Upper bound for one provider call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(250),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(4),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }
}

/// Router settings derived from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub default_target: ProviderTarget,
    pub default_tier: String,
    pub fallbacks: Vec<ProviderTarget>,
    pub plans: HashMap<String, PlanConfig>,
    pub policy: RetryPolicy,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl RouterSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let router = &config.router;
        Self {
            default_target: config.default_target(),
            default_tier: router.default_tier.clone(),
            fallbacks: router.fallbacks.clone(),
            plans: config
                .plans
                .iter()
                .map(|(tier, plan)| (tier.clone(), plan.clone()))
                .collect(),
            policy: RetryPolicy {
                max_attempts: router.max_attempts.max(1),
                initial_backoff: Duration::from_millis(router.backoff.initial_ms),
                backoff_factor: router.backoff.factor,
                max_backoff: Duration::from_millis(router.backoff.max_ms),
                call_timeout: config.provider_timeout(),
            },
            temperature: router.temperature,
            max_tokens: router.max_tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// One routed generation.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub messages: Vec<Message>,
    /// Explicit target; the router default when `None`.
    pub target: Option<ProviderTarget>,
    /// Plan tier of the caller; the router default when `None`.
    pub tier: Option<String>,
    pub temperature: Option<f32>,
}

/// A successful routed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    /// The target that actually produced `text`.
    pub served_by: ProviderTarget,
    pub usage: Usage,
    /// Attempts made across the whole chain.
    pub attempts: u32,
    pub fell_back: bool,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes generations to registered providers.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    settings: RouterSettings,
}

impl ProviderRouter {
    pub fn new(providers: Vec<Arc<dyn Provider>>, settings: RouterSettings) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.id().to_owned(), p))
            .collect();
        Self {
            providers,
            settings,
        }
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Registered provider ids, sorted.
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_provider(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    pub fn default_tier(&self) -> &str {
        &self.settings.default_tier
    }

    /// Whether `tier` may use `target`. No plans configured allows all.
    pub fn tier_allows(&self, tier: &str, target: &ProviderTarget) -> bool {
        if self.settings.plans.is_empty() {
            return true;
        }
        self.settings
            .plans
            .get(tier)
            .is_some_and(|plan| plan.allows_target(target))
    }

    /// Resolve the primary target and check it against the tier. Fails fast
    /// with a policy error, no provider is contacted.
    pub fn check(&self, target: Option<&ProviderTarget>, tier: Option<&str>) -> Result<ProviderTarget> {
        let target = target
            .cloned()
            .unwrap_or_else(|| self.settings.default_target.clone());
        let tier = tier.unwrap_or(&self.settings.default_tier);

        if !self.providers.contains_key(&target.provider) {
            return Err(AgentError::UnknownProvider {
                provider: target.provider,
            });
        }
        if !self.tier_allows(tier, &target) {
            return Err(AgentError::PolicyDenied {
                tier: tier.to_owned(),
                target: target.to_string(),
            });
        }
        Ok(target)
    }

    /// The primary target followed by the fallbacks this tier may use.
    fn chain(&self, primary: ProviderTarget, tier: &str) -> Vec<ProviderTarget> {
        let mut chain = vec![primary];
        for fallback in &self.settings.fallbacks {
            if chain.contains(fallback) {
                continue;
            }
            if !self.providers.contains_key(&fallback.provider) {
                tracing::debug!(target = %fallback, "skipping fallback without a registered provider");
                continue;
            }
            if !self.tier_allows(tier, fallback) {
                tracing::debug!(target = %fallback, tier, "skipping fallback outside plan tier");
                continue;
            }
            chain.push(fallback.clone());
        }
        chain
    }

    fn chat_request(&self, request: &RouteRequest, target: &ProviderTarget) -> ChatRequest {
        ChatRequest {
            model: target.model.clone(),
            messages: request.messages.clone(),
            temperature: Some(request.temperature.unwrap_or(self.settings.temperature)),
            max_tokens: Some(self.settings.max_tokens),
        }
    }

    // =======================================================================
    // Streaming
    // =======================================================================

    /// Stream a generation, forwarding each chunk to `out` as it arrives.
    ///
    /// On error, any chunks already forwarded stay with the caller; the
    /// router does not retry after the first forwarded chunk.
    pub async fn generate(
        &self,
        request: &RouteRequest,
        out: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<Generation> {
        let tier = request
            .tier
            .as_deref()
            .unwrap_or(&self.settings.default_tier)
            .to_owned();
        let primary = self.check(request.target.as_ref(), Some(&tier))?;
        let chain = self.chain(primary, &tier);

        let mut attempts = 0;
        let mut tried = Vec::new();
        let mut last_error = None;

        for (position, target) in chain.iter().enumerate() {
            let Some(provider) = self.providers.get(&target.provider) else {
                continue;
            };
            let chat = self.chat_request(request, target);
            let max_attempts = if position == 0 {
                self.settings.policy.max_attempts
            } else {
                1
            };
            tried.push(target.to_string());

            for attempt in 1..=max_attempts {
                attempts += 1;
                let started = Instant::now();
                let mut forwarded = String::new();
                let result = self
                    .attempt_stream(provider, &chat, out, cancel, &mut forwarded)
                    .await;

                match result {
                    Ok(outcome) => {
                        tracing::info!(
                            provider = %target.provider,
                            model = %target.model,
                            attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "generation served"
                        );
                        let usage = outcome
                            .usage
                            .unwrap_or_else(|| Usage::estimate(chat.prompt_chars(), forwarded.chars().count()));
                        return Ok(Generation {
                            text: forwarded,
                            served_by: target.clone(),
                            usage,
                            attempts,
                            fell_back: position > 0,
                        });
                    }
                    Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                    Err(e) if !forwarded.is_empty() => {
                        tracing::warn!(
                            provider = %target.provider,
                            model = %target.model,
                            error = %e,
                            "provider failed mid-stream"
                        );
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(
                            provider = %target.provider,
                            model = %target.model,
                            attempt,
                            transient = e.is_transient(),
                            error = %e,
                            "provider attempt failed"
                        );
                        let retry = e.is_transient() && attempt < max_attempts;
                        last_error = Some(e);
                        if !retry {
                            break;
                        }
                        self.sleep_backoff(attempt, cancel).await?;
                    }
                }
            }
        }

        Err(exhausted(tried, last_error))
    }

    /// One streaming call with the per-call timeout and cancellation.
    ///
    /// The provider writes into a private channel; chunks are relayed to
    /// `out` and mirrored into `forwarded`. Dropping the provider future on
    /// timeout or cancel releases its connection.
    async fn attempt_stream(
        &self,
        provider: &Arc<dyn Provider>,
        chat: &ChatRequest,
        out: &mpsc::Sender<String>,
        cancel: &CancellationToken,
        forwarded: &mut String,
    ) -> Result<StreamOutcome> {
        let (tx, mut rx) = mpsc::channel::<String>(CHUNK_BUFFER);

        let call = async move { provider.stream_chat(chat, &tx).await };
        let relay = async move {
            while let Some(chunk) = rx.recv().await {
                out.send(chunk.clone())
                    .await
                    .map_err(|_| AgentError::Cancelled)?;
                forwarded.push_str(&chunk);
            }
            Ok::<(), AgentError>(())
        };
        let work = async {
            let (result, relayed) = tokio::join!(call, relay);
            relayed?;
            result
        };

        let timeout = self.settings.policy.call_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            res = tokio::time::timeout(timeout, work) => match res {
                Ok(result) => result,
                Err(_) => Err(AgentError::ProviderTimeout {
                    provider: provider.id().to_owned(),
                    after: timeout,
                }),
            },
        }
    }

    // =======================================================================
    // Non-streaming
    // =======================================================================

    /// Non-streaming completion with the same retry and fallback policy.
    pub async fn complete(
        &self,
        request: &RouteRequest,
        cancel: &CancellationToken,
    ) -> Result<Generation> {
        let tier = request
            .tier
            .as_deref()
            .unwrap_or(&self.settings.default_tier)
            .to_owned();
        let primary = self.check(request.target.as_ref(), Some(&tier))?;
        let chain = self.chain(primary, &tier);
        let timeout = self.settings.policy.call_timeout;

        let mut attempts = 0;
        let mut tried = Vec::new();
        let mut last_error = None;

        for (position, target) in chain.iter().enumerate() {
            let Some(provider) = self.providers.get(&target.provider) else {
                continue;
            };
            let chat = self.chat_request(request, target);
            let max_attempts = if position == 0 {
                self.settings.policy.max_attempts
            } else {
                1
            };
            tried.push(target.to_string());

            for attempt in 1..=max_attempts {
                attempts += 1;
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(AgentError::Cancelled),
                    res = tokio::time::timeout(timeout, provider.complete(&chat)) => match res {
                        Ok(result) => result,
                        Err(_) => Err(AgentError::ProviderTimeout {
                            provider: target.provider.clone(),
                            after: timeout,
                        }),
                    },
                };

                match result {
                    Ok(text) => {
                        let usage = Usage::estimate(chat.prompt_chars(), text.chars().count());
                        return Ok(Generation {
                            text,
                            served_by: target.clone(),
                            usage,
                            attempts,
                            fell_back: position > 0,
                        });
                    }
                    Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
                    Err(e) => {
                        tracing::warn!(
                            provider = %target.provider,
                            model = %target.model,
                            attempt,
                            error = %e,
                            "completion attempt failed"
                        );
                        let retry = e.is_transient() && attempt < max_attempts;
                        last_error = Some(e);
                        if !retry {
                            break;
                        }
                        self.sleep_backoff(attempt, cancel).await?;
                    }
                }
            }
        }

        Err(exhausted(tried, last_error))
    }

    async fn sleep_backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<()> {
        let delay = self.settings.policy.backoff(attempt);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "retrying after backoff");
        tokio::select! {
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

fn exhausted(tried: Vec<String>, last: Option<AgentError>) -> AgentError {
    AgentError::ProvidersExhausted {
        tried,
        last: Box::new(
            last.unwrap_or_else(|| AgentError::Internal("no provider could be attempted".into())),
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// What a scripted provider does on one call.
    enum Step {
        Reply(Vec<&'static str>),
        Fail(u16),
        /// Emit chunks, then fail.
        Partial(Vec<&'static str>, u16),
        Hang,
    }

    struct Scripted {
        id: &'static str,
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(id: &'static str, steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                id,
                steps: Mutex::new(steps.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Step {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Fail(500))
        }

        fn fail(&self, status: u16) -> AgentError {
            AgentError::ProviderRequest {
                provider: self.id.into(),
                status: Some(status),
                reason: format!("scripted {status}"),
            }
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        async fn stream_chat(
            &self,
            _request: &ChatRequest,
            sink: &mpsc::Sender<String>,
        ) -> Result<StreamOutcome> {
            match self.next() {
                Step::Reply(chunks) => {
                    for c in chunks {
                        sink.send(c.to_owned()).await.map_err(|_| AgentError::Cancelled)?;
                    }
                    Ok(StreamOutcome::default())
                }
                Step::Fail(status) => Err(self.fail(status)),
                Step::Partial(chunks, status) => {
                    for c in chunks {
                        sink.send(c.to_owned()).await.map_err(|_| AgentError::Cancelled)?;
                    }
                    Err(self.fail(status))
                }
                Step::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn complete(&self, _request: &ChatRequest) -> Result<String> {
            match self.next() {
                Step::Reply(chunks) => Ok(chunks.concat()),
                Step::Fail(status) | Step::Partial(_, status) => Err(self.fail(status)),
                Step::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn settings(fallbacks: &[&str]) -> RouterSettings {
        RouterSettings {
            default_target: ProviderTarget::new("primary", "p-model"),
            default_tier: "free".into(),
            fallbacks: fallbacks.iter().map(|f| f.parse().unwrap()).collect(),
            plans: HashMap::new(),
            policy: RetryPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                call_timeout: Duration::from_millis(200),
                ..RetryPolicy::default()
            },
            temperature: 0.5,
            max_tokens: 256,
        }
    }

    fn router(providers: Vec<Arc<Scripted>>, settings: RouterSettings) -> ProviderRouter {
        ProviderRouter::new(
            providers.into_iter().map(|p| p as Arc<dyn Provider>).collect(),
            settings,
        )
    }

    fn request() -> RouteRequest {
        RouteRequest {
            messages: vec![Message::user("What is 2+2?")],
            ..RouteRequest::default()
        }
    }

    async fn run(router: &ProviderRouter) -> (Result<Generation>, Vec<String>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = router
            .generate(&request(), &tx, &CancellationToken::new())
            .await;
        drop(tx);
        let mut chunks = Vec::new();
        while let Some(c) = rx.recv().await {
            chunks.push(c);
        }
        (result, chunks)
    }

    #[tokio::test]
    async fn serves_from_primary() {
        let primary = Scripted::new("primary", vec![Step::Reply(vec!["4"])]);
        let router = router(vec![primary.clone()], settings(&[]));
        let (result, chunks) = run(&router).await;
        let generation = result.unwrap();
        assert_eq!(generation.text, "4");
        assert_eq!(generation.served_by.to_string(), "primary/p-model");
        assert!(generation.usage.estimated);
        assert!(!generation.fell_back);
        assert_eq!(chunks, vec!["4"]);
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let primary = Scripted::new("primary", vec![Step::Fail(503), Step::Reply(vec!["ok"])]);
        let router = router(vec![primary.clone()], settings(&[]));
        let generation = run(&router).await.0.unwrap();
        assert_eq!(generation.attempts, 2);
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn fallback_invoked_exactly_once_after_two_primary_failures() {
        let primary = Scripted::new("primary", vec![Step::Fail(503), Step::Fail(503), Step::Reply(vec!["late"])]);
        let secondary = Scripted::new("secondary", vec![Step::Reply(vec!["from ", "secondary"])]);
        let router = router(
            vec![primary.clone(), secondary.clone()],
            settings(&["secondary/s-model"]),
        );
        let (result, chunks) = run(&router).await;
        let generation = result.unwrap();
        assert_eq!(primary.calls(), 2);
        assert_eq!(secondary.calls(), 1);
        assert!(generation.fell_back);
        assert_eq!(generation.served_by.to_string(), "secondary/s-model");
        assert_eq!(chunks.concat(), "from secondary");
    }

    #[tokio::test]
    async fn failed_fallback_is_not_retried() {
        let primary = Scripted::new("primary", vec![Step::Fail(503), Step::Fail(503)]);
        let secondary = Scripted::new("secondary", vec![Step::Fail(503), Step::Reply(vec!["x"])]);
        let router = router(
            vec![primary.clone(), secondary.clone()],
            settings(&["secondary/s-model"]),
        );
        let err = run(&router).await.0.unwrap_err();
        assert_eq!(secondary.calls(), 1);
        match err {
            AgentError::ProvidersExhausted { tried, .. } => {
                assert_eq!(tried, vec!["primary/p-model", "secondary/s-model"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn non_transient_failure_skips_retry() {
        let primary = Scripted::new("primary", vec![Step::Fail(400)]);
        let secondary = Scripted::new("secondary", vec![Step::Reply(vec!["ok"])]);
        let router = router(
            vec![primary.clone(), secondary.clone()],
            settings(&["secondary/s-model"]),
        );
        assert!(run(&router).await.0.is_ok());
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn no_retry_after_forwarded_chunks() {
        let primary = Scripted::new("primary", vec![Step::Partial(vec!["half"], 503)]);
        let secondary = Scripted::new("secondary", vec![Step::Reply(vec!["x"])]);
        let router = router(
            vec![primary.clone(), secondary.clone()],
            settings(&["secondary/s-model"]),
        );
        let (result, chunks) = run(&router).await;
        assert!(result.is_err());
        assert_eq!(chunks, vec!["half"]);
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 0);
    }

    #[tokio::test]
    async fn timeout_counts_as_transient() {
        let primary = Scripted::new("primary", vec![Step::Hang, Step::Reply(vec!["ok"])]);
        let router = router(vec![primary.clone()], settings(&[]));
        let generation = run(&router).await.0.unwrap();
        assert_eq!(generation.text, "ok");
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_hanging_call() {
        let primary = Scripted::new("primary", vec![Step::Hang]);
        let mut s = settings(&[]);
        s.policy.call_timeout = Duration::from_secs(30);
        let router = router(vec![primary], s);

        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = router.generate(&request(), &tx, &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn disallowed_target_fails_fast() {
        let primary = Scripted::new("primary", vec![Step::Reply(vec!["x"])]);
        let mut s = settings(&[]);
        s.plans.insert(
            "free".into(),
            PlanConfig {
                providers: vec!["primary/other-model".into()],
                tools: vec![],
            },
        );
        let router = router(vec![primary.clone()], s);
        let err = run(&router).await.0.unwrap_err();
        assert!(matches!(err, AgentError::PolicyDenied { .. }));
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn fallback_outside_tier_is_skipped() {
        let primary = Scripted::new("primary", vec![Step::Fail(503), Step::Fail(503)]);
        let premium = Scripted::new("premium", vec![Step::Reply(vec!["x"])]);
        let mut s = settings(&["premium/big"]);
        s.plans.insert(
            "free".into(),
            PlanConfig {
                providers: vec!["primary/*".into()],
                tools: vec![],
            },
        );
        let router = router(vec![primary, premium.clone()], s);
        assert!(run(&router).await.0.is_err());
        assert_eq!(premium.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_provider_is_policy_error() {
        let router = router(vec![], settings(&[]));
        let err = run(&router).await.0.unwrap_err();
        assert!(matches!(err, AgentError::UnknownProvider { .. }));
    }

    #[tokio::test]
    async fn complete_uses_same_policy() {
        let primary = Scripted::new("primary", vec![Step::Fail(429), Step::Reply(vec!["{", "}"])]);
        let router = router(vec![primary.clone()], settings(&[]));
        let generation = router
            .complete(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(generation.text, "{}");
        assert_eq!(primary.calls(), 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_backoff: Duration::from_millis(300),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
    }
}
