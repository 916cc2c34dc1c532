//! Integration tests for converse-agent wiring: configuration files feed the
//! router, and the planner feeds the executor. No network access.

use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use converse_agent::{
    AgentError, AppConfig, ChatRequest, LlmClient, Message, PlanExecutor, Planner, Provider,
    ProviderRouter, ProviderTarget, RouteRequest, RouterSettings, StepStatus, StreamOutcome, Tool,
    ToolError, ToolRegistry, TurnEvent,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════
//  Fixtures
// ═══════════════════════════════════════════════════════════════════════

const CONFIG: &str = r#"
[router]
default_provider = "primary"
default_model = "small"
default_tier = "free"
max_attempts = 3
timeout_secs = 5
fallbacks = [
    { provider = "backup", model = "large" },
    { provider = "premium", model = "huge" },
]

[router.backoff]
initial_ms = 1
max_ms = 2

[[providers]]
id = "primary"
kind = "openai_compatible"
base_url = "http://127.0.0.1:9/v1"
api_key_env = "CONVERSE_TEST_PRIMARY_KEY"
models = ["small"]

[[providers]]
id = "backup"
kind = "openai_compatible"
base_url = "http://127.0.0.1:9/v1"
models = ["large"]

[[providers]]
id = "premium"
kind = "anthropic"
base_url = "http://127.0.0.1:9"
models = ["huge"]

[plans.free]
providers = ["primary/*", "backup/large"]
tools = ["calc.*"]

[plans.pro]
providers = ["primary/*", "backup/*", "premium/*"]
tools = ["calc.*"]
"#;

fn load_config() -> AppConfig {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    AppConfig::load(file.path()).unwrap()
}

/// Fails every call with the given transient or permanent error, or
/// answers with a fixed text.
struct Fixed {
    id: &'static str,
    answer: Option<String>,
    transient: bool,
    calls: AtomicU32,
}

impl Fixed {
    fn answering(id: &'static str, answer: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            answer: Some(answer.to_owned()),
            transient: false,
            calls: AtomicU32::new(0),
        })
    }

    fn failing(id: &'static str, transient: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            answer: None,
            transient,
            calls: AtomicU32::new(0),
        })
    }

    fn error(&self) -> AgentError {
        if self.transient {
            AgentError::ProviderRequest {
                provider: self.id.into(),
                status: Some(503),
                reason: "service unavailable".into(),
            }
        } else {
            AgentError::ProviderAuth {
                provider: self.id.into(),
                reason: "invalid key".into(),
            }
        }
    }
}

#[async_trait]
impl Provider for Fixed {
    fn id(&self) -> &str {
        self.id
    }

    async fn stream_chat(
        &self,
        _request: &ChatRequest,
        sink: &mpsc::Sender<String>,
    ) -> converse_agent::Result<StreamOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.answer {
            Some(text) => {
                sink.send(text.clone())
                    .await
                    .map_err(|_| AgentError::Cancelled)?;
                Ok(StreamOutcome::default())
            }
            None => Err(self.error()),
        }
    }

    async fn complete(&self, _request: &ChatRequest) -> converse_agent::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().ok_or_else(|| self.error())
    }
}

async fn generate(
    router: &ProviderRouter,
    tier: &str,
) -> converse_agent::Result<(String, ProviderTarget, bool)> {
    let (tx, mut rx) = mpsc::channel(16);
    let request = RouteRequest {
        messages: vec![Message::user("hello")],
        tier: Some(tier.to_owned()),
        ..RouteRequest::default()
    };
    let cancel = CancellationToken::new();
    let produce = async move {
        let result = router.generate(&request, &tx, &cancel).await;
        drop(tx);
        result
    };
    let relay = async {
        let mut text = String::new();
        while let Some(chunk) = rx.recv().await {
            text.push_str(&chunk);
        }
        text
    };
    let (result, streamed) = tokio::join!(produce, relay);
    let generation = result?;
    assert_eq!(generation.text, streamed);
    Ok((generation.text, generation.served_by, generation.fell_back))
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn config_file_replaces_provider_table() {
    let config = load_config();
    assert_eq!(config.providers.len(), 3);
    assert_eq!(config.default_target(), ProviderTarget::new("primary", "small"));
    assert_eq!(config.router.fallbacks.len(), 2);
    assert!(config.tier_allows_tool("free", "calc.add"));
    assert!(!config.tier_allows_tool("free", "web_search"));
}

#[test]
fn missing_api_key_is_reported_per_provider() {
    let config = load_config();
    let primary = config.provider("primary").unwrap();
    let err = LlmClient::from_config(primary).unwrap_err();
    assert!(matches!(err, AgentError::MissingApiKey { ref provider, .. } if provider == "primary"));
}

#[test]
fn missing_config_file_is_a_config_error() {
    let err = AppConfig::load("/definitely/not/here.toml").unwrap_err();
    assert!(matches!(err, AgentError::Config { .. }));
}

// ═══════════════════════════════════════════════════════════════════════
//  Routing from configuration
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn transient_failures_retry_then_fall_back() {
    let config = load_config();
    let primary = Fixed::failing("primary", true);
    let backup = Fixed::answering("backup", "from backup");
    let router = ProviderRouter::new(
        vec![primary.clone() as Arc<dyn Provider>, backup.clone()],
        RouterSettings::from_config(&config),
    );

    let (text, served_by, fell_back) = generate(&router, "free").await.unwrap();
    assert_eq!(text, "from backup");
    assert_eq!(served_by, ProviderTarget::new("backup", "large"));
    assert!(fell_back);
    assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
    assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn permanent_failure_skips_retries() {
    let config = load_config();
    let primary = Fixed::failing("primary", false);
    let backup = Fixed::answering("backup", "ok");
    let router = ProviderRouter::new(
        vec![primary.clone() as Arc<dyn Provider>, backup.clone()],
        RouterSettings::from_config(&config),
    );

    generate(&router, "free").await.unwrap();
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fallbacks_outside_the_tier_are_not_tried() {
    let config = load_config();
    let primary = Fixed::failing("primary", false);
    let backup = Fixed::failing("backup", false);
    let premium = Fixed::answering("premium", "expensive");
    let router = ProviderRouter::new(
        vec![primary.clone() as Arc<dyn Provider>, backup.clone(), premium.clone()],
        RouterSettings::from_config(&config),
    );

    let err = generate(&router, "free").await.unwrap_err();
    assert!(matches!(err, AgentError::ProvidersExhausted { .. }));
    assert_eq!(premium.calls.load(Ordering::SeqCst), 0);

    let (text, served_by, _) = generate(&router, "pro").await.unwrap();
    assert_eq!(text, "expensive");
    assert_eq!(served_by.provider, "premium");
}

// ═══════════════════════════════════════════════════════════════════════
//  Planner into executor
// ═══════════════════════════════════════════════════════════════════════

struct Add;

#[async_trait]
impl Tool for Add {
    fn name(&self) -> &str {
        "calc.add"
    }

    fn description(&self) -> &str {
        "Add two integers"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
            "required": ["a", "b"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let a = arguments["a"].as_i64().ok_or_else(|| ToolError::invalid("calc.add", "a"))?;
        let b = arguments["b"].as_i64().ok_or_else(|| ToolError::invalid("calc.add", "b"))?;
        Ok(json!(a + b))
    }
}

#[tokio::test]
async fn planned_steps_run_through_the_registry() {
    let config = load_config();
    let plan_json = r#"{"steps": [
        {"tool": "calc.add", "arguments": {"a": 2, "b": 2}},
        {"tool": "calc.add", "arguments": {"a": "two", "b": 2}}
    ], "synthesis": "Report the sum"}"#;
    let provider = Fixed::answering("primary", plan_json);
    let router = Arc::new(ProviderRouter::new(
        vec![provider as Arc<dyn Provider>],
        RouterSettings::from_config(&config),
    ));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(Add)).unwrap();
    let registry = Arc::new(registry);

    let planner = Planner::new(router);
    let cancel = CancellationToken::new();
    let plan = planner
        .plan(
            "What is 2+2?",
            &registry.descriptors(|name| config.tier_allows_tool("free", name)),
            None,
            None,
            Some("free".into()),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.synthesis, "Report the sum");

    let executor = PlanExecutor::new(registry, Duration::from_secs(1));
    let (tx, mut rx) = mpsc::channel(32);
    let report = executor
        .execute(&plan, |name| config.tier_allows_tool("free", name), &tx, Uuid::now_v7(), &cancel)
        .await
        .unwrap();
    drop(tx);

    assert_eq!(report.invocations[0].status, StepStatus::Completed);
    assert_eq!(report.invocations[0].output, Some(json!(4)));
    assert_eq!(report.invocations[1].status, StepStatus::Failed);
    assert!(report.findings().contains("[step 0] calc.add"));

    let mut started = 0;
    while let Some(event) = rx.recv().await {
        if matches!(event, TurnEvent::ToolStarted { .. }) {
            started += 1;
        }
    }
    assert_eq!(started, 2);
}
