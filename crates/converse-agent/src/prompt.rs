//! Prompt assembly and quick fact capture.
//!
//! A prompt is one system message (persona, date, language, mode rules,
//! known facts, retrieved context and research findings) followed by the
//! recent complete turns of the session and finally the user message.

use chrono::{DateTime, Utc};
use converse_store::{Fact, MessageRole, MessageStatus, StoredMessage};
use regex::Regex;

use crate::error::{AgentError, Result};
use crate::llm::types::Message;
use crate::retrieval::{ContextBundle, ContextItem};
use crate::turn::Mode;

const PERSONA: &str = "You are Converse, a helpful and knowledgeable assistant. \
Answer accurately, say so when you are unsure, and never invent sources.";

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Everything that goes into one prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub message: &'a str,
    pub mode: Mode,
    pub language: Option<&'a str>,
    pub facts: &'a [Fact],
    pub context: &'a ContextBundle,
    /// Session history, oldest first. Only complete turns are replayed.
    pub history: &'a [StoredMessage],
    /// Tool results for a research synthesis.
    pub findings: Option<&'a str>,
    /// Synthesis instruction from the plan.
    pub synthesis: Option<&'a str>,
}

impl<'a> PromptInput<'a> {
    pub fn new(message: &'a str, mode: Mode, context: &'a ContextBundle) -> Self {
        Self {
            message,
            mode,
            language: None,
            facts: &[],
            context,
            history: &[],
            findings: None,
            synthesis: None,
        }
    }
}

/// Builds chat messages from a [`PromptInput`].
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    history_turns: usize,
}

impl PromptBuilder {
    /// `history_turns` is the number of user/assistant pairs replayed.
    pub fn new(history_turns: u32) -> Self {
        Self {
            history_turns: history_turns as usize,
        }
    }

    pub fn build(&self, input: &PromptInput<'_>) -> Vec<Message> {
        self.build_at(input, Utc::now())
    }

    fn build_at(&self, input: &PromptInput<'_>, now: DateTime<Utc>) -> Vec<Message> {
        let mut messages = vec![Message::system(system_text(input, now))];
        messages.extend(self.replay(input.history));
        messages.push(Message::user(input.message));
        messages
    }

    /// The tail of complete user/assistant messages. Pending, cancelled and
    /// failed messages never reach a later prompt.
    fn replay(&self, history: &[StoredMessage]) -> Vec<Message> {
        let complete: Vec<&StoredMessage> = history
            .iter()
            .filter(|m| m.status == MessageStatus::Complete)
            .filter(|m| m.role != MessageRole::System)
            .collect();
        let keep = self.history_turns * 2;
        let start = complete.len().saturating_sub(keep);
        complete[start..]
            .iter()
            .map(|m| match m.role {
                MessageRole::Assistant => Message::assistant(m.content.clone()),
                _ => Message::user(m.content.clone()),
            })
            .collect()
    }
}

fn system_text(input: &PromptInput<'_>, now: DateTime<Utc>) -> String {
    let mut out = String::from(PERSONA);
    out.push_str(&format!(
        "\nToday is {}.",
        now.format("%A, %B %-d, %Y")
    ));

    if let Some(hint) = language_hint(input.language) {
        out.push('\n');
        out.push_str(&hint);
    }

    match input.mode {
        Mode::Plain => out.push_str("\nBe concise: answer directly in a few sentences."),
        Mode::WebSearch => out.push_str(
            "\nUse the web results below when they are relevant and cite their URLs.",
        ),
        Mode::DeepResearch => out.push_str(
            "\nWrite a thorough, well-structured answer grounded in the research findings below.",
        ),
    }

    if !input.facts.is_empty() {
        out.push_str("\n\nKnown facts about the user:");
        for fact in input.facts {
            out.push_str(&format!("\n- {}: {}", fact.key, fact.value));
        }
    }

    let memory: Vec<&ContextItem> = input.context.memory().collect();
    if !memory.is_empty() {
        out.push_str("\n\nRelevant past conversations:");
        for item in memory {
            if let ContextItem::Memory { text, .. } = item {
                out.push_str(&format!("\n- {}", text.replace('\n', " ")));
            }
        }
    }

    let web: Vec<&ContextItem> = input.context.web().collect();
    if !web.is_empty() {
        out.push_str("\n\nWeb search results:");
        for item in web {
            if let ContextItem::Web {
                title,
                url,
                snippet,
            } = item
            {
                out.push_str(&format!("\n- {title}: {snippet} ({url})"));
            }
        }
    }

    if let Some(findings) = input.findings.filter(|f| !f.trim().is_empty()) {
        out.push_str("\n\nResearch findings:\n");
        out.push_str(findings);
    }
    if let Some(synthesis) = input.synthesis.filter(|s| !s.trim().is_empty()) {
        out.push_str("\n\nTask: ");
        out.push_str(synthesis);
    }

    out
}

fn language_hint(language: Option<&str>) -> Option<String> {
    let language = language.map(str::trim).filter(|l| !l.is_empty())?;
    Some(match language.to_ascii_lowercase().as_str() {
        "en" | "english" => return None,
        "hi" | "hindi" => "Respond in Hindi using Devanagari script.".to_owned(),
        "hinglish" => "Respond in Hinglish (Hindi written in Latin script).".to_owned(),
        _ => format!("Respond in {language}."),
    })
}

// ---------------------------------------------------------------------------
// Quick capture
// ---------------------------------------------------------------------------

const NAME_PATTERN: &str = r"(?i)\b(?:my name is|mera naam)\s+([\p{L}][\p{L}'\-]*)";
const REMEMBER_PATTERN: &str = r"(?is)\bremember that\s+(.+)";

/// A fact lifted directly from the user's wording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFact {
    pub key: String,
    pub value: String,
}

/// Detects "my name is X" and "remember that Y" in a message.
#[derive(Debug, Clone)]
pub struct FactCapture {
    name: Regex,
    remember: Regex,
}

impl FactCapture {
    pub fn new() -> Result<Self> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| AgentError::Internal(format!("bad capture pattern `{p}`: {e}")))
        };
        Ok(Self {
            name: compile(NAME_PATTERN)?,
            remember: compile(REMEMBER_PATTERN)?,
        })
    }

    /// Notes are keyed `note:<unix millis>` so repeated notes never
    /// overwrite each other.
    pub fn capture(&self, text: &str, now: DateTime<Utc>) -> Vec<CapturedFact> {
        let mut captured = Vec::new();

        if let Some(name) = self.name.captures(text).and_then(|c| c.get(1)) {
            captured.push(CapturedFact {
                key: "name".to_owned(),
                value: name.as_str().to_owned(),
            });
        }

        if let Some(note) = self.remember.captures(text).and_then(|c| c.get(1)) {
            let value = note
                .as_str()
                .trim()
                .trim_end_matches(['.', '!', '?'])
                .trim();
            if !value.is_empty() {
                captured.push(CapturedFact {
                    key: format!("note:{}", now.timestamp_millis()),
                    value: value.to_owned(),
                });
            }
        }

        captured
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn stored(id: i64, role: MessageRole, content: &str, status: MessageStatus) -> StoredMessage {
        StoredMessage {
            id,
            conversation_id: "s".into(),
            role,
            content: content.into(),
            status,
            metadata: json!({}),
            created_at: id,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 0, 0).unwrap()
    }

    #[test]
    fn plain_prompt_shape() {
        let bundle = ContextBundle::default();
        let input = PromptInput::new("What is 2+2?", Mode::Plain, &bundle);
        let messages = PromptBuilder::new(3).build_at(&input, fixed_now());

        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("Friday, March 14, 2025"));
        assert!(messages[0].content.contains("Be concise"));
        assert_eq!(messages[1], Message::user("What is 2+2?"));
    }

    #[test]
    fn context_sections_are_rendered() {
        let bundle = ContextBundle {
            items: vec![
                ContextItem::Memory {
                    id: "m1".into(),
                    text: "User: hi\nAssistant: hello".into(),
                    distance: 0.1,
                },
                ContextItem::Web {
                    title: "Rust".into(),
                    url: "https://rust-lang.org".into(),
                    snippet: "A language".into(),
                },
            ],
            warnings: vec![],
        };
        let facts = vec![Fact {
            owner: "u".into(),
            key: "name".into(),
            value: "Asha".into(),
            updated_at: 0,
        }];
        let mut input = PromptInput::new("tell me", Mode::WebSearch, &bundle);
        input.facts = &facts;
        input.language = Some("hindi");

        let system = &PromptBuilder::new(3).build_at(&input, fixed_now())[0].content;
        assert!(system.contains("- name: Asha"));
        assert!(system.contains("Relevant past conversations:\n- User: hi Assistant: hello"));
        assert!(system.contains("- Rust: A language (https://rust-lang.org)"));
        assert!(system.contains("Devanagari"));
        assert!(!system.contains("Be concise"));
    }

    #[test]
    fn history_replays_only_complete_turns() {
        let history = vec![
            stored(1, MessageRole::User, "old question", MessageStatus::Complete),
            stored(2, MessageRole::Assistant, "old answer", MessageStatus::Complete),
            stored(3, MessageRole::User, "interrupted", MessageStatus::Cancelled),
            stored(4, MessageRole::Assistant, "half a rep", MessageStatus::Cancelled),
            stored(5, MessageRole::User, "q2", MessageStatus::Complete),
            stored(6, MessageRole::Assistant, "a2", MessageStatus::Complete),
        ];
        let bundle = ContextBundle::default();
        let mut input = PromptInput::new("now", Mode::Plain, &bundle);
        input.history = &history;

        let messages = PromptBuilder::new(1).build_at(&input, fixed_now());
        let replayed: Vec<&str> = messages[1..messages.len() - 1]
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(replayed, vec!["q2", "a2"]);
    }

    #[test]
    fn research_findings_land_in_system_text() {
        let bundle = ContextBundle::default();
        let mut input = PromptInput::new("compare", Mode::DeepResearch, &bundle);
        input.findings = Some("[step 0] web_search: results");
        input.synthesis = Some("Compare the two options");
        let system = &PromptBuilder::new(1).build_at(&input, fixed_now())[0].content;
        assert!(system.contains("Research findings:\n[step 0] web_search: results"));
        assert!(system.contains("Task: Compare the two options"));
    }

    #[test]
    fn english_needs_no_language_hint() {
        assert_eq!(language_hint(Some("English")), None);
        assert_eq!(language_hint(Some("  ")), None);
        assert_eq!(
            language_hint(Some("French")).as_deref(),
            Some("Respond in French.")
        );
    }

    #[test]
    fn captures_name_and_note() {
        let now = fixed_now();
        let capture = FactCapture::new().unwrap();
        let facts = capture.capture("Hi, my name is Ravi. Remember that I like tea.", now);
        assert_eq!(
            facts,
            vec![
                CapturedFact {
                    key: "name".into(),
                    value: "Ravi".into()
                },
                CapturedFact {
                    key: format!("note:{}", now.timestamp_millis()),
                    value: "I like tea".into()
                },
            ]
        );
        assert!(capture.capture("What is 2+2?", now).is_empty());
    }
}
