//! The provider seam.
//!
//! A [`Provider`] is one language-model backend. It knows nothing about
//! retries, fallbacks or plan tiers; [`super::router::ProviderRouter`] owns
//! those. Implementations push text chunks into the sink as they arrive and
//! must stop promptly when the sink is closed.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::llm::types::{ChatRequest, StreamOutcome};

#[async_trait]
pub trait Provider: Send + Sync {
    /// Identifier matching the `[[providers]]` entry (`groq`, `anthropic`).
    fn id(&self) -> &str;

    /// Stream a reply, sending each text chunk to `sink` in order.
    ///
    /// A closed sink means the caller gave up; implementations return
    /// [`crate::AgentError::Cancelled`] and drop the connection.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        sink: &mpsc::Sender<String>,
    ) -> Result<StreamOutcome>;

    /// Non-streaming completion returning the full text.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;
}
