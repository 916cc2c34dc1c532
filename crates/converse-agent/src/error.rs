//! Agent error types.
//!
//! Every subsystem of the conversation engine surfaces failures through
//! [`AgentError`]. [`AgentError::kind`] folds the variants into the coarse
//! taxonomy that callers and the transport see; [`AgentError::is_transient`]
//! decides whether the provider router may retry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use converse_store::StoreError;

/// Unified error type for the conversation engine.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Provider errors -----------------------------------------------------
    /// An HTTP request to a provider failed, either before a response arrived
    /// (`status` is `None`) or with a non-success status.
    #[error("provider `{provider}` request failed: {reason}")]
    ProviderRequest {
        provider: String,
        status: Option<u16>,
        reason: String,
    },

    /// The provider rejected our credentials.
    #[error("provider `{provider}` rejected credentials: {reason}")]
    ProviderAuth { provider: String, reason: String },

    /// The provider call did not finish within the per-call timeout.
    #[error("provider `{provider}` timed out after {}ms", after.as_millis())]
    ProviderTimeout { provider: String, after: Duration },

    /// The streaming connection broke or carried an error payload.
    #[error("provider `{provider}` stream error: {reason}")]
    ProviderStream { provider: String, reason: String },

    /// The provider answered with something we could not interpret.
    #[error("provider `{provider}` returned a malformed response: {reason}")]
    ProviderParse { provider: String, reason: String },

    /// The API key environment variable for a provider is unset.
    #[error("missing api key for provider `{provider}` (set {env_var})")]
    MissingApiKey { provider: String, env_var: String },

    /// Every target of the retry/fallback chain failed.
    #[error("all providers failed (tried {}): {last}", tried.join(", "))]
    ProvidersExhausted {
        tried: Vec<String>,
        last: Box<AgentError>,
    },

    // -- Policy errors -------------------------------------------------------
    /// The caller's plan tier does not allow the requested provider/model.
    #[error("plan tier `{tier}` does not allow `{target}`")]
    PolicyDenied { tier: String, target: String },

    /// A provider id that is not registered with the router.
    #[error("unknown provider: {provider}")]
    UnknownProvider { provider: String },

    /// The message was empty after sanitization.
    #[error("empty message")]
    EmptyInput,

    /// The session already has an active generation.
    #[error("session `{session_id}` is busy with another reply")]
    SessionBusy { session_id: String },

    /// Malformed request fields.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    // -- Retrieval errors ----------------------------------------------------
    /// The vector store or the search collaborator failed or timed out.
    #[error("{source_name} lookup failed: {reason}")]
    Retrieval {
        source_name: &'static str,
        reason: String,
    },

    // -- Tool errors ---------------------------------------------------------
    #[error(transparent)]
    Tool(#[from] ToolError),

    // -- Persistence ---------------------------------------------------------
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    // -- Control flow --------------------------------------------------------
    /// The turn was cancelled by the user or by a newer request.
    #[error("cancelled")]
    Cancelled,

    // -- Configuration -------------------------------------------------------
    #[error("config error: {reason}")]
    Config { reason: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors. Prefer a typed variant
    /// whenever possible.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Coarse error classification carried by terminal `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Provider,
    Retrieval,
    Tool,
    Policy,
    Persistence,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::Retrieval => "retrieval",
            Self::Tool => "tool",
            Self::Policy => "policy",
            Self::Persistence => "persistence",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProviderRequest { .. }
            | Self::ProviderAuth { .. }
            | Self::ProviderTimeout { .. }
            | Self::ProviderStream { .. }
            | Self::ProviderParse { .. }
            | Self::MissingApiKey { .. }
            | Self::ProvidersExhausted { .. } => ErrorKind::Provider,
            Self::PolicyDenied { .. }
            | Self::UnknownProvider { .. }
            | Self::EmptyInput
            | Self::SessionBusy { .. }
            | Self::InvalidRequest { .. } => ErrorKind::Policy,
            Self::Retrieval { .. } => ErrorKind::Retrieval,
            Self::Tool(_) => ErrorKind::Tool,
            Self::Store(_) => ErrorKind::Persistence,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config { .. } | Self::Json(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a provider failure may succeed on an immediate retry against
    /// the same provider: timeouts, broken connections, rate limits and
    /// server-side errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ProviderTimeout { .. } | Self::ProviderStream { .. } => true,
            Self::ProviderRequest { status, .. } => match status {
                None => true,
                Some(code) => *code == 408 || *code == 429 || *code >= 500,
            },
            _ => false,
        }
    }

    /// Map a `reqwest` failure for `provider` onto the taxonomy.
    pub fn from_http(provider: &str, err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            return Self::ProviderTimeout {
                provider: provider.to_owned(),
                after: timeout,
            };
        }
        Self::ProviderRequest {
            provider: provider.to_owned(),
            status: err.status().map(|s| s.as_u16()),
            reason: err.to_string(),
        }
    }
}

/// Failure of a single tool invocation.
///
/// Recorded per plan step; only a step marked as required stops the plan.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {tool}")]
    NotFound { tool: String },

    /// The tool exists but is switched off or outside the caller's tier.
    #[error("tool `{tool}` is not available: {reason}")]
    Unavailable { tool: String, reason: String },

    #[error("invalid arguments for `{tool}`: {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A safety check refused the invocation (path escape, blocked command).
    #[error("tool `{tool}` refused: {reason}")]
    Denied { tool: String, reason: String },

    #[error("tool `{tool}` timed out after {}ms", after.as_millis())]
    Timeout { tool: String, after: Duration },

    #[error("tool `{tool}` failed: {reason}")]
    Failed { tool: String, reason: String },

    /// Registration-time rejection.
    #[error("cannot register tool `{tool}`: {reason}")]
    Registration { tool: String, reason: String },
}

impl ToolError {
    pub fn failed(tool: &str, reason: impl std::fmt::Display) -> Self {
        Self::Failed {
            tool: tool.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(tool: &str, reason: impl std::fmt::Display) -> Self {
        Self::InvalidArguments {
            tool: tool.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub fn denied(tool: &str, reason: impl std::fmt::Display) -> Self {
        Self::Denied {
            tool: tool.to_owned(),
            reason: reason.to_string(),
        }
    }
}
