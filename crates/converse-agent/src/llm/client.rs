//! HTTP provider client.
//!
//! Speaks the **OpenAI Chat Completions API** (Groq, OpenAI, Mistral,
//! Google's OpenAI endpoint, OpenRouter, NVIDIA) and the **Anthropic
//! Messages API**, in streaming SSE and non-streaming modes. Both dialects
//! are normalized into plain text chunks.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{AgentError, Result};
use crate::llm::provider::Provider;
use crate::llm::streaming::{SseParser, StreamEvent};
use crate::llm::streaming_openai::OpenAiStreamAccumulator;
use crate::llm::types::{ChatRequest, Message, Role, StreamOutcome, Usage};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic requires `max_tokens`; used when the request carries none.
const DEFAULT_MAX_TOKENS: u32 = 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error bodies are cut to this many characters in error messages.
const ERROR_BODY_CHARS: usize = 300;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A [`Provider`] backed by an HTTP endpoint.
///
/// Total call duration is bounded by the router, not here; dropping the
/// future mid-stream drops the response body and releases the connection.
#[derive(Debug, Clone)]
pub struct LlmClient {
    id: String,
    kind: ProviderKind,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(
        id: impl Into<String>,
        kind: ProviderKind,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let id = id.into();
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            id,
            kind,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            http,
        })
    }

    /// Build a client for a configured provider, reading its API key from
    /// the environment.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let api_key = config.api_key().ok_or_else(|| AgentError::MissingApiKey {
            provider: config.id.clone(),
            env_var: config.api_key_env.clone().unwrap_or_default(),
        })?;
        Self::new(&config.id, config.kind, &config.base_url, api_key)
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    // =======================================================================
    // Request building
    // =======================================================================

    fn build_body(&self, request: &ChatRequest, stream: bool) -> Value {
        match self.kind {
            ProviderKind::OpenaiCompatible => build_openai_request_body(request, stream),
            ProviderKind::Anthropic => build_anthropic_request_body(request, stream),
        }
    }

    fn endpoint(&self) -> String {
        match self.kind {
            ProviderKind::OpenaiCompatible => format!("{}/chat/completions", self.base_url),
            ProviderKind::Anthropic => format!("{}/v1/messages", self.base_url),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let invalid = |e: reqwest::header::InvalidHeaderValue| AgentError::ProviderAuth {
            provider: self.id.clone(),
            reason: format!("invalid API key header: {e}"),
        };

        match self.kind {
            ProviderKind::OpenaiCompatible => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(invalid)?,
                );
            }
            ProviderKind::Anthropic => {
                headers.insert("x-api-key", HeaderValue::from_str(&self.api_key).map_err(invalid)?);
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// POST `body` and turn non-success statuses into typed errors.
    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let url = self.endpoint();
        tracing::debug!(url = %url, model = %body["model"], provider = %self.id, "sending provider request");

        let resp = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::from_http(&self.id, e, CONNECT_TIMEOUT))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        let reason = format!(
            "API returned {status}: {}",
            text.chars().take(ERROR_BODY_CHARS).collect::<String>()
        );
        Err(match status.as_u16() {
            401 | 403 => AgentError::ProviderAuth {
                provider: self.id.clone(),
                reason,
            },
            code => AgentError::ProviderRequest {
                provider: self.id.clone(),
                status: Some(code),
                reason,
            },
        })
    }

    // =======================================================================
    // Stream consumption
    // =======================================================================

    async fn consume_openai_stream(
        &self,
        resp: reqwest::Response,
        sink: &mpsc::Sender<String>,
    ) -> Result<StreamOutcome> {
        let mut accumulator = OpenAiStreamAccumulator::new(&self.id);
        let mut lines = LineBuffer::default();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| self.stream_error(e))?;
            lines.push(&chunk);

            while let Some(line) = lines.next_line() {
                if let Some(delta) = accumulator.feed_line(&line)? {
                    forward(sink, delta).await?;
                }
                if accumulator.is_done() {
                    return Ok(accumulator.finish().1);
                }
            }
        }

        if let Some(line) = lines.take_rest()
            && let Some(delta) = accumulator.feed_line(&line)?
        {
            forward(sink, delta).await?;
        }
        Ok(accumulator.finish().1)
    }

    async fn consume_anthropic_stream(
        &self,
        resp: reqwest::Response,
        sink: &mpsc::Sender<String>,
    ) -> Result<StreamOutcome> {
        let mut parser = SseParser::new(&self.id);
        let mut lines = LineBuffer::default();
        let mut byte_stream = resp.bytes_stream();

        let mut input_tokens = None;
        let mut output_tokens = None;
        let mut stop_reason = None;

        'read: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| self.stream_error(e))?;
            lines.push(&chunk);

            while let Some(line) = lines.next_line() {
                match parser.parse_line(&line)? {
                    Some(StreamEvent::MessageStart { input_tokens: n }) => input_tokens = n,
                    Some(StreamEvent::TextDelta(text)) if !text.is_empty() => {
                        forward(sink, text).await?;
                    }
                    Some(StreamEvent::MessageDelta {
                        stop_reason: reason,
                        output_tokens: n,
                    }) => {
                        stop_reason = reason.or(stop_reason);
                        output_tokens = n.or(output_tokens);
                    }
                    Some(StreamEvent::MessageStop) => break 'read,
                    _ => {}
                }
            }
        }

        let usage = match (input_tokens, output_tokens) {
            (None, None) => None,
            (i, o) => Some(Usage {
                input_tokens: i.unwrap_or(0),
                output_tokens: o.unwrap_or(0),
                estimated: false,
            }),
        };
        Ok(StreamOutcome { usage, stop_reason })
    }

    fn stream_error(&self, err: reqwest::Error) -> AgentError {
        AgentError::ProviderStream {
            provider: self.id.clone(),
            reason: format!("stream read error: {err}"),
        }
    }
}

#[async_trait]
impl Provider for LlmClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        sink: &mpsc::Sender<String>,
    ) -> Result<StreamOutcome> {
        let body = self.build_body(request, true);
        let resp = self.send(&body).await?;
        match self.kind {
            ProviderKind::OpenaiCompatible => self.consume_openai_stream(resp, sink).await,
            ProviderKind::Anthropic => self.consume_anthropic_stream(resp, sink).await,
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let body = self.build_body(request, false);
        let resp = self.send(&body).await?;
        let v: Value = resp.json().await.map_err(|e| AgentError::ProviderParse {
            provider: self.id.clone(),
            reason: format!("invalid JSON response: {e}"),
        })?;

        let text = match self.kind {
            ProviderKind::OpenaiCompatible => parse_openai_response(&v),
            ProviderKind::Anthropic => parse_anthropic_response(&v),
        };
        text.ok_or_else(|| AgentError::ProviderParse {
            provider: self.id.clone(),
            reason: "response carried no text content".into(),
        })
    }
}

/// Push one chunk to the caller; a closed sink means the turn was abandoned.
async fn forward(sink: &mpsc::Sender<String>, text: String) -> Result<()> {
    sink.send(text).await.map_err(|_| AgentError::Cancelled)
}

// ---------------------------------------------------------------------------
// Line buffering
// ---------------------------------------------------------------------------

/// Splits a byte stream into lines. Works on bytes so multi-byte UTF-8
/// sequences split across network chunks survive.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }

    fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

// ===========================================================================
// Wire format conversion (free functions)
// ===========================================================================

/// Build the JSON body for the OpenAI Chat Completions API.
pub fn build_openai_request_body(request: &ChatRequest, stream: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

/// Build the JSON body for the Anthropic Messages API. System messages are
/// lifted into the top-level `system` field.
pub fn build_anthropic_request_body(request: &ChatRequest, stream: bool) -> Value {
    let (system, messages) = messages_to_anthropic(&request.messages);

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if let Some(system) = system {
        body["system"] = json!(system);
    }
    if let Some(temp) = request.temperature {
        body["temperature"] = json!(temp);
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

fn messages_to_anthropic(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => match &mut system {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },
            Role::User | Role::Assistant => {
                wire_messages.push(json!({
                    "role": msg.role.as_str(),
                    "content": msg.content,
                }));
            }
        }
    }

    (system, wire_messages)
}

/// Text of a non-streaming Chat Completions response.
pub fn parse_openai_response(v: &Value) -> Option<String> {
    v["choices"][0]["message"]["content"]
        .as_str()
        .map(String::from)
}

/// Concatenated text blocks of a non-streaming Messages API response.
pub fn parse_anthropic_response(v: &Value) -> Option<String> {
    let blocks = v["content"].as_array()?;
    Some(
        blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".into(),
            messages: vec![
                Message::system("be brief"),
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("2+2?"),
            ],
            temperature: Some(0.5),
            max_tokens: Some(64),
        }
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(status: &str, content_type: &str, body: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    async fn collect(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk);
        }
        out
    }

    #[test]
    fn openai_body_shape() {
        let body = build_openai_request_body(&request(), true);
        assert_eq!(body["model"], "m");
        assert_eq!(body["messages"].as_array().unwrap().len(), 4);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 64);
    }

    #[test]
    fn anthropic_body_lifts_system() {
        let body = build_anthropic_request_body(&request(), false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn anthropic_body_defaults_max_tokens() {
        let mut req = request();
        req.max_tokens = None;
        let body = build_anthropic_request_body(&req, true);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn parse_non_streaming_responses() {
        let openai = json!({"choices":[{"message":{"role":"assistant","content":"4"}}]});
        assert_eq!(parse_openai_response(&openai).as_deref(), Some("4"));
        assert!(parse_openai_response(&json!({})).is_none());

        let anthropic = json!({"content":[{"type":"text","text":"Hel"},{"type":"text","text":"lo"}]});
        assert_eq!(parse_anthropic_response(&anthropic).as_deref(), Some("Hello"));
    }

    #[test]
    fn line_buffer_keeps_split_utf8() {
        let mut lines = LineBuffer::default();
        let bytes = "data: é\n".as_bytes();
        lines.push(&bytes[..7]);
        assert!(lines.next_line().is_none());
        lines.push(&bytes[7..]);
        assert_eq!(lines.next_line().as_deref(), Some("data: é"));
        assert!(lines.take_rest().is_none());
    }

    #[tokio::test]
    async fn openai_stream_forwards_chunks() {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"2+2 \"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"is 4\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let url = serve_once("200 OK", "text/event-stream", body).await;
        let client = LlmClient::new("local", ProviderKind::OpenaiCompatible, url, "k").unwrap();

        let (tx, rx) = mpsc::channel(16);
        let outcome = client.stream_chat(&request(), &tx).await.unwrap();
        drop(tx);
        assert_eq!(collect(rx).await, vec!["2+2 ", "is 4"]);
        assert_eq!(outcome.stop_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn anthropic_stream_forwards_chunks_and_usage() {
        let body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":9}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"4\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":1}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let url = serve_once("200 OK", "text/event-stream", body).await;
        let client = LlmClient::new("anthropic", ProviderKind::Anthropic, url, "k").unwrap();

        let (tx, rx) = mpsc::channel(16);
        let outcome = client.stream_chat(&request(), &tx).await.unwrap();
        drop(tx);
        assert_eq!(collect(rx).await, vec!["4"]);
        let usage = outcome.usage.unwrap();
        assert_eq!((usage.input_tokens, usage.output_tokens), (9, 1));
    }

    #[tokio::test]
    async fn rate_limit_status_is_transient() {
        let url = serve_once("429 Too Many Requests", "application/json", "{\"error\":\"slow down\"}").await;
        let client = LlmClient::new("groq", ProviderKind::OpenaiCompatible, url, "k").unwrap();
        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, AgentError::ProviderRequest { status: Some(429), .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn unauthorized_status_is_auth_error() {
        let url = serve_once("401 Unauthorized", "application/json", "{}").await;
        let client = LlmClient::new("groq", ProviderKind::OpenaiCompatible, url, "bad").unwrap();
        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, AgentError::ProviderAuth { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn complete_returns_text() {
        let url = serve_once(
            "200 OK",
            "application/json",
            r#"{"choices":[{"message":{"role":"assistant","content":"pong"}}]}"#,
        )
        .await;
        let client = LlmClient::new("groq", ProviderKind::OpenaiCompatible, url, "k").unwrap();
        assert_eq!(client.complete(&request()).await.unwrap(), "pong");
    }

    #[test]
    fn missing_key_is_reported() {
        let config = ProviderConfig {
            id: "x".into(),
            kind: ProviderKind::OpenaiCompatible,
            base_url: "http://localhost".into(),
            api_key_env: Some("CONVERSE_TEST_UNSET_KEY_VAR".into()),
            models: vec![],
        };
        let err = LlmClient::from_config(&config).unwrap_err();
        assert!(matches!(err, AgentError::MissingApiKey { .. }));
    }
}
