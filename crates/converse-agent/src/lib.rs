//! Conversation engine for Converse.
//!
//! This crate turns one inbound message into a context-augmented,
//! provider-routed, cancellable streamed reply.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!   TurnRequest ─>│ Orchestrator │──> TurnStream (thinking, token, ..., complete)
//!                 └──────┬───────┘
//!        ┌───────────────┼──────────────┬──────────────┐
//!  ┌─────┴─────┐  ┌──────┴──────┐  ┌────┴────┐  ┌──────┴───────┐
//!  │  Session  │  │  Retrieval  │  │ Planner │  │   Provider   │
//!  │  Manager  │  │   Engine    │  │+Executor│  │    Router    │
//!  └───────────┘  └──────┬──────┘  └────┬────┘  └──────┬───────┘
//!                 ┌──────┴──────┐  ┌────┴────┐  ┌──────┴───────┐
//!                 │ MemoryStore │  │  Tools  │  │  LlmClient   │
//!                 │ + WebSearch │  │         │  │ (OpenAI/SSE, │
//!                 └─────────────┘  └─────────┘  │  Anthropic)  │
//!                                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`] -- Turn entry point, persistence and reconciliation.
//! - [`session`] -- Per-session generation state machine and busy policy.
//! - [`llm`] -- Provider trait, HTTP clients, stream parsers and the router.
//! - [`retrieval`] -- Memory and web context with timeouts and budgets.
//! - [`planner`] -- Goal decomposition into tool plans.
//! - [`executor`] -- Sequential plan execution.
//! - [`tools`] -- Tool trait and schema-validating registry.
//! - [`prompt`] -- Prompt assembly and quick fact capture.
//! - [`guard`] -- Input sanitization.
//! - [`turn`] -- Request and event types.
//! - [`config`] -- TOML configuration.
//! - [`error`] -- Agent error types.

pub mod config;
pub mod error;
pub mod executor;
pub mod guard;
pub mod llm;
pub mod orchestrator;
pub mod planner;
pub mod prompt;
pub mod retrieval;
pub mod session;
pub mod tools;
pub mod turn;

// Re-export the most commonly used types at the crate root.
pub use config::{AppConfig, PlanConfig, ProviderConfig, ProviderKind};
pub use error::{AgentError, ErrorKind, Result, ToolError};
pub use executor::{PlanExecutor, PlanReport, StepStatus, ToolInvocation};
pub use guard::{GuardedInput, InputGuard};
pub use llm::{
    ChatRequest, Generation, LlmClient, Message, Provider, ProviderRouter, ProviderTarget,
    RetryPolicy, Role, RouteRequest, RouterSettings, StreamOutcome, Usage,
};
pub use orchestrator::{Orchestrator, ReconcileReport, TurnStream};
pub use planner::{Plan, PlanStep, Planner};
pub use prompt::{CapturedFact, FactCapture, PromptBuilder, PromptInput};
pub use retrieval::{
    ContextBundle, ContextItem, RetrievalEngine, RetrievalQuery, RetrievalSettings, SearchHit,
    WebSearch,
};
pub use session::{BusyPolicy, GenerationState, SessionManager, TurnGuard};
pub use tools::{Tool, ToolDescriptor, ToolRegistry};
pub use turn::{Mode, TurnEvent, TurnRequest};
