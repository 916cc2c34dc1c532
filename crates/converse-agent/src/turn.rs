//! Turn-level request and event types.
//!
//! A turn is one user message and the reply it produces. [`TurnRequest`] is
//! what callers hand to the orchestrator; [`TurnEvent`] is what comes back
//! on the event stream, serialized with a `type` tag for the transport.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, ErrorKind};
use crate::llm::types::{ProviderTarget, Usage};
use crate::session::BusyPolicy;

/// Execution mode of a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Direct answer; memory lookup only if configured.
    #[default]
    Plain,
    /// Memory plus live web results.
    WebSearch,
    /// Memory, web, then plan/execute tools before the streamed synthesis.
    DeepResearch,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::WebSearch => "web_search",
            Self::DeepResearch => "deep_research",
        }
    }

    pub fn wants_web(&self) -> bool {
        !matches!(self, Self::Plain)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" | "" => Ok(Self::Plain),
            "web_search" | "web" => Ok(Self::WebSearch),
            "deep_research" | "deep" => Ok(Self::DeepResearch),
            other => Err(AgentError::InvalidRequest {
                reason: format!("unknown mode `{other}`"),
            }),
        }
    }
}

/// One inbound message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// Plan tier of the caller, set by the embedding server from its own
    /// account data; the configured default when absent. Never taken from
    /// client input.
    #[serde(default)]
    pub tier: Option<String>,
    /// Owner for facts and memory; the session id when absent.
    #[serde(default)]
    pub owner: Option<String>,
    /// Overrides the configured busy policy for this request.
    #[serde(default)]
    pub busy_policy: Option<BusyPolicy>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_target(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = Some(policy);
        self
    }

    pub fn owner(&self) -> &str {
        self.owner.as_deref().unwrap_or(&self.session_id)
    }
}

/// Events emitted for one turn, in order: `thinking`, then any mix of
/// `info`, `tool_started`, `tool_finished` and `token`, then exactly one of
/// `complete`, `error` or `cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Thinking {
        turn_id: Uuid,
        mode: Mode,
    },
    /// Non-fatal status. Outside a turn (voice toggle) there is no turn id.
    Info {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<Uuid>,
        message: String,
    },
    ToolStarted {
        turn_id: Uuid,
        step: u32,
        tool: String,
        description: String,
    },
    ToolFinished {
        turn_id: Uuid,
        step: u32,
        tool: String,
        ok: bool,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Token {
        turn_id: Uuid,
        text: String,
    },
    Complete {
        turn_id: Uuid,
        text: String,
        served_by: ProviderTarget,
        usage: Usage,
        /// `false` when the turn still waits in the reconciliation queue.
        durable: bool,
    },
    Error {
        turn_id: Uuid,
        kind: ErrorKind,
        reason: String,
        /// Text already streamed before the failure.
        partial: String,
    },
    Cancelled {
        turn_id: Uuid,
        partial: String,
    },
}

impl TurnEvent {
    pub fn turn_id(&self) -> Option<Uuid> {
        match self {
            Self::Info { turn_id, .. } => *turn_id,
            Self::Thinking { turn_id, .. }
            | Self::ToolStarted { turn_id, .. }
            | Self::ToolFinished { turn_id, .. }
            | Self::Token { turn_id, .. }
            | Self::Complete { turn_id, .. }
            | Self::Error { turn_id, .. }
            | Self::Cancelled { turn_id, .. } => Some(*turn_id),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Error { .. } | Self::Cancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parse_and_display() {
        assert_eq!("deep_research".parse::<Mode>().unwrap(), Mode::DeepResearch);
        assert_eq!("web".parse::<Mode>().unwrap(), Mode::WebSearch);
        assert!("loud".parse::<Mode>().is_err());
        assert_eq!(Mode::WebSearch.to_string(), "web_search");
    }

    #[test]
    fn events_are_type_tagged() {
        let id = Uuid::nil();
        let v = serde_json::to_value(TurnEvent::Token {
            turn_id: id,
            text: "4".into(),
        })
        .unwrap();
        assert_eq!(v["type"], "token");
        assert_eq!(v["text"], "4");

        let v = serde_json::to_value(TurnEvent::Error {
            turn_id: id,
            kind: ErrorKind::Provider,
            reason: "down".into(),
            partial: String::new(),
        })
        .unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["kind"], "provider");
    }

    #[test]
    fn request_defaults_owner_to_session() {
        let req = TurnRequest::new("s1", "hi");
        assert_eq!(req.owner(), "s1");
        assert_eq!(req.mode, Mode::Plain);
        let req: TurnRequest =
            serde_json::from_str(r#"{"session_id":"s","message":"m","mode":"web_search"}"#).unwrap();
        assert_eq!(req.mode, Mode::WebSearch);
    }

    #[test]
    fn info_outside_a_turn_has_no_id() {
        let ev = TurnEvent::Info {
            turn_id: None,
            message: "Microphone armed.".into(),
        };
        assert_eq!(ev.turn_id(), None);
        let v = serde_json::to_value(&ev).unwrap();
        assert!(v.get("turn_id").is_none());
    }

    #[test]
    fn terminal_events() {
        let id = Uuid::nil();
        assert!(
            TurnEvent::Cancelled {
                turn_id: id,
                partial: String::new()
            }
            .is_terminal()
        );
        assert!(!TurnEvent::Thinking { turn_id: id, mode: Mode::Plain }.is_terminal());
    }
}
