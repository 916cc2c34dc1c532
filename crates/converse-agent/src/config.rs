//! Application configuration.
//!
//! [`AppConfig`] is read once at startup from a TOML file and handed to every
//! component by `Arc`. Every field has a default, so an empty file (or no
//! file at all) yields a working configuration that talks to Groq.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::llm::types::ProviderTarget;
use crate::session::BusyPolicy;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub router: RouterConfig,
    pub providers: Vec<ProviderConfig>,
    pub plans: BTreeMap<String, PlanConfig>,
    pub retrieval: RetrievalConfig,
    pub tools: ToolsConfig,
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            providers: ProviderConfig::presets(),
            plans: PlanConfig::presets(),
            retrieval: RetrievalConfig::default(),
            tools: ToolsConfig::default(),
            store: StoreConfig::default(),
            session: SessionConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[router]`: default target, retry/fallback policy and sampling defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub default_provider: String,
    pub default_model: String,
    /// Plan tier applied when a request names none.
    pub default_tier: String,
    /// Upper bound for one provider call, streaming included.
    pub timeout_secs: u64,
    /// Attempts against the same provider (initial + retries).
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Tried in order, once each, after the primary gives up.
    pub fallbacks: Vec<ProviderTarget>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_provider: "groq".into(),
            default_model: "llama-3.1-8b-instant".into(),
            default_tier: "free".into(),
            timeout_secs: 60,
            max_attempts: 2,
            backoff: BackoffConfig::default(),
            fallbacks: Vec::new(),
            temperature: 0.5,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            factor: 2.0,
            max_ms: 4000,
        }
    }
}

/// Wire dialect spoken by a provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompatible,
    Anthropic,
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Models advertised for this provider; informational.
    #[serde(default)]
    pub models: Vec<String>,
}

impl ProviderConfig {
    fn preset(id: &str, kind: ProviderKind, base_url: &str, env: &str, models: &[&str]) -> Self {
        Self {
            id: id.into(),
            kind,
            base_url: base_url.into(),
            api_key_env: Some(env.into()),
            models: models.iter().map(|m| (*m).to_owned()).collect(),
        }
    }

    /// Built-in provider table.
    pub fn presets() -> Vec<Self> {
        use ProviderKind::{Anthropic, OpenaiCompatible};
        vec![
            Self::preset(
                "groq",
                OpenaiCompatible,
                "https://api.groq.com/openai/v1",
                "GROQ_API_KEY",
                &["llama-3.1-8b-instant", "llama-3.3-70b-versatile"],
            ),
            Self::preset(
                "openai",
                OpenaiCompatible,
                "https://api.openai.com/v1",
                "OPENAI_API_KEY",
                &["gpt-4o-mini", "gpt-4o"],
            ),
            Self::preset(
                "mistral",
                OpenaiCompatible,
                "https://api.mistral.ai/v1",
                "MISTRAL_API_KEY",
                &["mistral-large-latest", "mistral-small-latest"],
            ),
            Self::preset(
                "google",
                OpenaiCompatible,
                "https://generativelanguage.googleapis.com/v1beta/openai",
                "GOOGLE_API_KEY",
                &["gemini-1.5-flash", "gemini-1.5-pro"],
            ),
            Self::preset(
                "openrouter",
                OpenaiCompatible,
                "https://openrouter.ai/api/v1",
                "OPENROUTER_API_KEY",
                &["mistralai/mistral-7b-instruct"],
            ),
            Self::preset(
                "nvidia",
                OpenaiCompatible,
                "https://integrate.api.nvidia.com/v1",
                "NVIDIA_API_KEY",
                &["meta/llama-3.1-70b-instruct"],
            ),
            Self::preset(
                "anthropic",
                Anthropic,
                "https://api.anthropic.com",
                "ANTHROPIC_API_KEY",
                &["claude-3-5-haiku-latest", "claude-3-5-sonnet-latest"],
            ),
        ]
    }

    /// The API key from the environment, if configured and set.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty())
    }
}

/// `[plans.<tier>]`: what a plan tier may use.
///
/// `providers` entries are `provider/model` or `provider/*`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub providers: Vec<String>,
    pub tools: Vec<String>,
}

impl PlanConfig {
    fn new(providers: &[&str], tools: &[&str]) -> Self {
        Self {
            providers: providers.iter().map(|p| (*p).to_owned()).collect(),
            tools: tools.iter().map(|t| (*t).to_owned()).collect(),
        }
    }

    /// Built-in `free`, `pro` and `enterprise` tiers.
    pub fn presets() -> BTreeMap<String, Self> {
        let free_tools = ["web_search", "memory.get_fact", "memory.set_fact"];
        let pro_tools = [
            "web_search",
            "memory.get_fact",
            "memory.set_fact",
            "browser.scrape_url",
            "files.read_file",
            "files.write_file",
            "files.list_dir",
            "system.get_system_info",
        ];
        let mut enterprise_tools = pro_tools.to_vec();
        enterprise_tools.push("system.execute_command");

        BTreeMap::from([
            (
                "free".to_owned(),
                Self::new(&["groq/*", "google/gemini-1.5-flash"], &free_tools),
            ),
            (
                "pro".to_owned(),
                Self::new(
                    &["groq/*", "google/*", "mistral/*", "openai/gpt-4o-mini", "openrouter/*"],
                    &pro_tools,
                ),
            ),
            (
                "enterprise".to_owned(),
                Self::new(
                    &["groq/*", "google/*", "mistral/*", "openai/*", "openrouter/*", "nvidia/*", "anthropic/*"],
                    &enterprise_tools,
                ),
            ),
        ])
    }

    pub fn allows_target(&self, target: &ProviderTarget) -> bool {
        self.providers.iter().any(|pattern| match pattern.split_once('/') {
            Some((provider, "*")) => provider == target.provider,
            Some((provider, model)) => provider == target.provider && model == target.model,
            None => pattern == &target.provider,
        })
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|pattern| match pattern.strip_suffix(".*") {
            Some(prefix) => tool.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('.')),
            None => pattern == tool,
        })
    }
}

/// `[retrieval]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Per-item character budget.
    pub item_chars: usize,
    /// Whole-bundle character budget.
    pub total_chars: usize,
    pub vector_timeout_ms: u64,
    pub search_timeout_ms: u64,
    pub search_results: usize,
    /// Memory records farther than this cosine distance are ignored.
    pub max_distance: f32,
    /// Whether `plain` mode consults memory at all.
    pub memory_in_plain: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            item_chars: 600,
            total_chars: 4000,
            vector_timeout_ms: 2000,
            search_timeout_ms: 8000,
            search_results: 5,
            max_distance: 0.9,
            memory_in_plain: true,
        }
    }
}

/// `[tools]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Per-tool switch; tools missing from the map are enabled.
    pub enabled: BTreeMap<String, bool>,
    pub timeout_secs: u64,
    /// Root directory for the `files.*` tools.
    pub workspace_root: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: BTreeMap::new(),
            timeout_secs: 30,
            workspace_root: PathBuf::from("workspace"),
        }
    }
}

/// `[store]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub retention_days: u64,
    pub embedding_dimension: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/converse.db"),
            retention_days: 30,
            embedding_dimension: 384,
        }
    }
}

/// `[session]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Past turns (user + assistant pairs) included in prompts.
    pub history_turns: u32,
    pub busy_policy: BusyPolicy,
    pub max_input_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_turns: 6,
            busy_policy: BusyPolicy::Reject,
            max_input_chars: 5000,
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading and queries
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| AgentError::Config {
            reason: format!("invalid TOML: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| Err(AgentError::Config { reason });

        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if p.id.is_empty() || !seen.insert(p.id.as_str()) {
                return fail(format!("provider id `{}` is empty or duplicated", p.id));
            }
        }
        if self.provider(&self.router.default_provider).is_none() {
            return fail(format!(
                "router.default_provider `{}` is not a configured provider",
                self.router.default_provider
            ));
        }
        for fallback in &self.router.fallbacks {
            if self.provider(&fallback.provider).is_none() {
                return fail(format!("fallback `{fallback}` names an unknown provider"));
            }
        }
        if self.router.max_attempts == 0 {
            return fail("router.max_attempts must be at least 1".into());
        }
        if !self.plans.is_empty() && !self.plans.contains_key(&self.router.default_tier) {
            return fail(format!(
                "router.default_tier `{}` has no [plans] entry",
                self.router.default_tier
            ));
        }
        for (tier, plan) in &self.plans {
            for pattern in &plan.providers {
                let provider = pattern.split_once('/').map_or(pattern.as_str(), |(p, _)| p);
                if self.provider(provider).is_none() {
                    return fail(format!("plan `{tier}` allows unknown provider `{provider}`"));
                }
            }
        }
        if self.retrieval.item_chars == 0 || self.retrieval.total_chars == 0 {
            return fail("retrieval budgets must be positive".into());
        }
        if self.session.max_input_chars == 0 {
            return fail("session.max_input_chars must be positive".into());
        }
        if self.store.embedding_dimension == 0 {
            return fail("store.embedding_dimension must be positive".into());
        }
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn default_target(&self) -> ProviderTarget {
        ProviderTarget::new(&self.router.default_provider, &self.router.default_model)
    }

    /// Whether `tier` may use `target`. With no plans configured everything
    /// is allowed; an unknown tier allows nothing.
    pub fn tier_allows_target(&self, tier: &str, target: &ProviderTarget) -> bool {
        if self.plans.is_empty() {
            return true;
        }
        self.plans
            .get(tier)
            .is_some_and(|plan| plan.allows_target(target))
    }

    pub fn tool_enabled(&self, tool: &str) -> bool {
        self.tools.enabled.get(tool).copied().unwrap_or(true)
    }

    /// Enabled and inside the tier's allow-list.
    pub fn tier_allows_tool(&self, tier: &str, tool: &str) -> bool {
        if !self.tool_enabled(tool) {
            return false;
        }
        if self.plans.is_empty() {
            return true;
        }
        self.plans.get(tier).is_some_and(|plan| plan.allows_tool(tool))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.store.retention_days.saturating_mul(24 * 60 * 60))
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.router.timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.router.max_attempts, 2);
        assert_eq!(config.router.temperature, 0.5);
        assert_eq!(config.session.max_input_chars, 5000);
        assert_eq!(config.providers.len(), 7);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.router.default_provider, "groq");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn sections_override_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [router]
            default_provider = "openai"
            default_model = "gpt-4o-mini"
            default_tier = "pro"
            fallbacks = [{ provider = "groq", model = "llama-3.1-8b-instant" }]

            [session]
            busy_policy = "preempt"
            history_turns = 2

            [tools.enabled]
            "system.execute_command" = false
            "#,
        )
        .unwrap();
        assert_eq!(config.default_target().to_string(), "openai/gpt-4o-mini");
        assert_eq!(config.router.fallbacks.len(), 1);
        assert_eq!(config.session.busy_policy, BusyPolicy::Preempt);
        assert!(!config.tool_enabled("system.execute_command"));
        assert!(config.tool_enabled("web_search"));
    }

    #[test]
    fn unknown_fallback_provider_is_rejected() {
        let err = AppConfig::from_toml_str(
            r#"
            [router]
            fallbacks = [{ provider = "nope", model = "x" }]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn zero_budget_is_rejected() {
        let err = AppConfig::from_toml_str("[retrieval]\ntotal_chars = 0\n").unwrap_err();
        assert!(matches!(err, AgentError::Config { .. }));
    }

    #[test]
    fn tier_target_patterns() {
        let config = AppConfig::default();
        let groq = ProviderTarget::new("groq", "anything");
        let gpt4o = ProviderTarget::new("openai", "gpt-4o");
        assert!(config.tier_allows_target("free", &groq));
        assert!(!config.tier_allows_target("free", &gpt4o));
        assert!(!config.tier_allows_target("pro", &gpt4o));
        assert!(config.tier_allows_target("enterprise", &gpt4o));
        assert!(!config.tier_allows_target("unknown", &groq));
    }

    #[test]
    fn tier_tool_lists() {
        let config = AppConfig::default();
        assert!(config.tier_allows_tool("free", "web_search"));
        assert!(!config.tier_allows_tool("free", "files.read_file"));
        assert!(config.tier_allows_tool("pro", "files.read_file"));
        assert!(!config.tier_allows_tool("pro", "system.execute_command"));
        assert!(config.tier_allows_tool("enterprise", "system.execute_command"));
    }

    #[test]
    fn wildcard_tool_patterns() {
        let plan = PlanConfig::new(&[], &["files.*"]);
        assert!(plan.allows_tool("files.read_file"));
        assert!(!plan.allows_tool("filesystem"));
    }

    #[test]
    fn retention_in_days() {
        let mut config = AppConfig::default();
        config.store.retention_days = 2;
        assert_eq!(config.retention(), Duration::from_secs(2 * 86_400));
    }
}
