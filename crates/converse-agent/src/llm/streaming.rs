//! SSE stream parser for the Anthropic Messages API.
//!
//! The Anthropic streaming format sends `event:` and `data:` lines in
//! standard SSE format. Only the parts the conversation engine needs are
//! kept: text deltas, usage counters, the stop reason and error payloads.

use serde_json::Value;

use crate::error::{AgentError, Result};

/// One parsed Anthropic stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// `message_start`, carrying the prompt token count.
    MessageStart { input_tokens: Option<u32> },
    /// A text fragment from a `content_block_delta`.
    TextDelta(String),
    /// `message_delta`, carrying the stop reason and output token count.
    MessageDelta {
        stop_reason: Option<String>,
        output_tokens: Option<u32>,
    },
    MessageStop,
    Ping,
}

/// Parses raw SSE lines from the Anthropic Messages API stream.
///
/// Accumulates partial state across calls because SSE events span multiple
/// lines (`event:` followed by `data:`).
#[derive(Debug)]
pub struct SseParser {
    provider: String,
    /// The most recently seen `event:` type.
    current_event_type: Option<String>,
}

impl SseParser {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            current_event_type: None,
        }
    }

    /// Feed a single line from the SSE stream.
    ///
    /// Returns `Some(event)` when a complete event has been parsed, `None` for
    /// comment lines, blank lines, or the `event:` prefix line. An `error`
    /// event becomes [`AgentError::ProviderStream`].
    pub fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>> {
        let line = line.trim_end();

        if line.starts_with(':') || line.is_empty() {
            return Ok(None);
        }

        if let Some(event_type) = line.strip_prefix("event:") {
            self.current_event_type = Some(event_type.trim().to_owned());
            return Ok(None);
        }

        if let Some(data) = line.strip_prefix("data:") {
            let event_type = self
                .current_event_type
                .take()
                .unwrap_or_else(|| "unknown".into());
            return self.parse_event(&event_type, data.trim());
        }

        tracing::trace!(line, "ignoring unrecognised SSE line");
        Ok(None)
    }

    fn parse_event(&self, event_type: &str, data: &str) -> Result<Option<StreamEvent>> {
        match event_type {
            "message_start" => {
                let v = self.parse_json(data)?;
                Ok(Some(StreamEvent::MessageStart {
                    input_tokens: json_u32(&v["message"]["usage"], "input_tokens"),
                }))
            }

            "content_block_delta" => {
                let v = self.parse_json(data)?;
                let delta = &v["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => Ok(Some(StreamEvent::TextDelta(
                        delta["text"].as_str().unwrap_or_default().to_owned(),
                    ))),
                    other => {
                        tracing::trace!(delta_type = ?other, "ignoring non-text delta");
                        Ok(None)
                    }
                }
            }

            "message_delta" => {
                let v = self.parse_json(data)?;
                Ok(Some(StreamEvent::MessageDelta {
                    stop_reason: v["delta"]["stop_reason"].as_str().map(String::from),
                    output_tokens: json_u32(&v["usage"], "output_tokens"),
                }))
            }

            "message_stop" => Ok(Some(StreamEvent::MessageStop)),

            "ping" => Ok(Some(StreamEvent::Ping)),

            "error" => {
                let v = self.parse_json(data)?;
                let message = v["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error");
                Err(AgentError::ProviderStream {
                    provider: self.provider.clone(),
                    reason: message.to_owned(),
                })
            }

            _ => {
                if data == "[DONE]" {
                    Ok(Some(StreamEvent::MessageStop))
                } else {
                    tracing::trace!(event_type, "ignoring SSE event type");
                    Ok(None)
                }
            }
        }
    }

    fn parse_json(&self, data: &str) -> Result<Value> {
        serde_json::from_str(data).map_err(|e| AgentError::ProviderParse {
            provider: self.provider.clone(),
            reason: format!("invalid JSON in SSE data: {e}"),
        })
    }
}

fn json_u32(v: &Value, field: &str) -> Option<u32> {
    v[field].as_u64().map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut SseParser, event: &str, data: &str) -> Result<Option<StreamEvent>> {
        assert!(parser.parse_line(&format!("event: {event}"))?.is_none());
        parser.parse_line(&format!("data: {data}"))
    }

    #[test]
    fn parse_message_start_usage() {
        let mut parser = SseParser::new("anthropic");
        let event = feed(
            &mut parser,
            "message_start",
            r#"{"type":"message_start","message":{"id":"msg_01","usage":{"input_tokens":10,"output_tokens":0}}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::MessageStart {
                input_tokens: Some(10)
            }
        );
    }

    #[test]
    fn parse_text_delta() {
        let mut parser = SseParser::new("anthropic");
        let event = feed(
            &mut parser,
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event, StreamEvent::TextDelta("Hello".into()));
    }

    #[test]
    fn non_text_delta_is_skipped() {
        let mut parser = SseParser::new("anthropic");
        let event = feed(
            &mut parser,
            "content_block_delta",
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{"}}"#,
        )
        .unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn parse_message_delta() {
        let mut parser = SseParser::new("anthropic");
        let event = feed(
            &mut parser,
            "message_delta",
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::MessageDelta {
                stop_reason: Some("end_turn".into()),
                output_tokens: Some(7)
            }
        );
    }

    #[test]
    fn error_event_is_stream_error() {
        let mut parser = SseParser::new("anthropic");
        let err = feed(
            &mut parser,
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::ProviderStream { ref reason, .. } if reason == "Overloaded"));
        assert!(err.is_transient());
    }

    #[test]
    fn blank_and_comment_lines_ignored() {
        let mut parser = SseParser::new("anthropic");
        assert!(parser.parse_line("").unwrap().is_none());
        assert!(parser.parse_line(": keepalive").unwrap().is_none());
    }

    #[test]
    fn stop_and_ping() {
        let mut parser = SseParser::new("anthropic");
        assert_eq!(
            feed(&mut parser, "message_stop", "{}").unwrap(),
            Some(StreamEvent::MessageStop)
        );
        assert_eq!(feed(&mut parser, "ping", "{}").unwrap(), Some(StreamEvent::Ping));
    }
}
