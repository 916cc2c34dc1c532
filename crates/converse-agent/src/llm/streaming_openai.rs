//! SSE stream parser for the OpenAI Chat Completions API.
//!
//! The OpenAI streaming format sends `data:` lines with JSON payloads
//! containing `choices[].delta` objects and terminates with `data: [DONE]`.
//! Groq, Mistral, OpenRouter, NVIDIA and Google's OpenAI endpoint all speak
//! this dialect.

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::{StreamOutcome, Usage};

// ---------------------------------------------------------------------------
// Stream accumulator
// ---------------------------------------------------------------------------

/// Accumulates fragments from an OpenAI SSE stream.
#[derive(Debug)]
pub struct OpenAiStreamAccumulator {
    provider: String,

    /// Accumulated text content from `choices[].delta.content`.
    text: String,

    /// Whether the `[DONE]` sentinel has been received.
    done: bool,

    /// Usage from chunks that carry a `usage` field (typically the final
    /// chunk before `[DONE]`).
    usage: Option<Usage>,

    stop_reason: Option<String>,
}

impl OpenAiStreamAccumulator {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            text: String::new(),
            done: false,
            usage: None,
            stop_reason: None,
        }
    }

    /// Returns `true` once the `[DONE]` sentinel has been received.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Feed a single SSE line from the stream.
    ///
    /// Returns `Ok(Some(text_delta))` when a non-empty text delta is present,
    /// `Ok(None)` for everything else. Mid-stream `error` payloads become
    /// [`AgentError::ProviderStream`].
    pub fn feed_line(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim_end();

        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }

        let Some(data) = line.strip_prefix("data:") else {
            // `event:` lines or other SSE fields.
            return Ok(None);
        };
        let data = data.trim();

        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::ProviderParse {
            provider: self.provider.clone(),
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;

        if let Some(error) = v.get("error").filter(|e| !e.is_null()) {
            let reason = error["message"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Err(AgentError::ProviderStream {
                provider: self.provider.clone(),
                reason,
            });
        }

        if let Some(usage_obj) = v.get("usage").filter(|u| !u.is_null()) {
            let field = |name: &str| {
                usage_obj[name]
                    .as_u64()
                    .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
                    .unwrap_or(0)
            };
            self.usage = Some(Usage {
                input_tokens: field("prompt_tokens"),
                output_tokens: field("completion_tokens"),
                estimated: false,
            });
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.stop_reason = Some(reason.to_owned());
        }

        match choice["delta"]["content"].as_str() {
            Some(content) if !content.is_empty() => {
                self.text.push_str(content);
                Ok(Some(content.to_owned()))
            }
            _ => Ok(None),
        }
    }

    /// Consume the accumulator, returning the full text and the outcome.
    pub fn finish(self) -> (String, StreamOutcome) {
        (
            self.text,
            StreamOutcome {
                usage: self.usage,
                stop_reason: self.stop_reason,
            },
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_accumulation() {
        let mut acc = OpenAiStreamAccumulator::new("groq");

        let delta1 = acc
            .feed_line(r#"data: {"id":"c1","choices":[{"index":0,"delta":{"content":"Hello"}}]}"#)
            .unwrap();
        assert_eq!(delta1, Some("Hello".to_owned()));

        let delta2 = acc
            .feed_line(r#"data: {"id":"c1","choices":[{"index":0,"delta":{"content":" world"}}]}"#)
            .unwrap();
        assert_eq!(delta2, Some(" world".to_owned()));

        let (text, outcome) = acc.finish();
        assert_eq!(text, "Hello world");
        assert!(outcome.usage.is_none());
    }

    #[test]
    fn done_sentinel_sets_flag() {
        let mut acc = OpenAiStreamAccumulator::new("groq");
        assert!(!acc.is_done());
        assert!(acc.feed_line("data: [DONE]").unwrap().is_none());
        assert!(acc.is_done());
    }

    #[test]
    fn blank_and_comment_lines_ignored() {
        let mut acc = OpenAiStreamAccumulator::new("groq");
        assert!(acc.feed_line("").unwrap().is_none());
        assert!(acc.feed_line(": keepalive").unwrap().is_none());
        assert!(acc.feed_line("event: message").unwrap().is_none());
    }

    #[test]
    fn role_only_and_empty_deltas_yield_nothing() {
        let mut acc = OpenAiStreamAccumulator::new("groq");
        assert!(
            acc.feed_line(r#"data: {"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn usage_and_finish_reason_are_captured() {
        let mut acc = OpenAiStreamAccumulator::new("openai");
        acc.feed_line(
            r#"data: {"choices":[{"index":0,"delta":{"content":"4"},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":1}}"#,
        )
        .unwrap();
        let (_, outcome) = acc.finish();
        assert_eq!(outcome.stop_reason.as_deref(), Some("stop"));
        let usage = outcome.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 1);
        assert!(!usage.estimated);
    }

    #[test]
    fn error_payload_is_stream_error() {
        let mut acc = OpenAiStreamAccumulator::new("openrouter");
        let err = acc
            .feed_line(r#"data: {"error":{"message":"upstream overloaded","code":502}}"#)
            .unwrap_err();
        assert!(matches!(err, AgentError::ProviderStream { .. }));
    }

    #[test]
    fn invalid_json_returns_error() {
        let mut acc = OpenAiStreamAccumulator::new("groq");
        let err = acc.feed_line("data: {invalid json}").unwrap_err();
        assert!(matches!(err, AgentError::ProviderParse { .. }));
    }
}
