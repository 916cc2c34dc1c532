//! Language-model integration layer.
//!
//! - [`types`] -- Provider-agnostic messages, requests, targets and usage.
//! - [`provider`] -- The [`Provider`] trait every backend implements.
//! - [`client`] -- HTTP client for OpenAI-compatible and Anthropic APIs.
//! - [`router`] -- Retry, fallback and plan-tier policy over providers.
//! - [`streaming`] -- SSE parser for Anthropic incremental responses.
//! - [`streaming_openai`] -- SSE parser for OpenAI incremental responses.

pub mod client;
pub mod provider;
pub mod router;
pub mod streaming;
pub mod streaming_openai;
pub mod types;

pub use client::LlmClient;
pub use provider::Provider;
pub use router::{Generation, ProviderRouter, RetryPolicy, RouteRequest, RouterSettings};
pub use types::{ChatRequest, Message, ProviderTarget, Role, StreamOutcome, Usage};
