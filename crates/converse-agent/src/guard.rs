//! Input guard.
//!
//! Every inbound message passes through [`InputGuard::sanitize`] before it is
//! persisted or shown to a model: control characters go, whitespace is
//! collapsed, length is bounded and known prompt-injection phrases are
//! replaced with `[FILTERED]`.

use regex::{Regex, RegexBuilder};

use crate::error::{AgentError, Result};

const FILTERED: &str = "[FILTERED]";

const INJECTION_PATTERNS: &[&str] = &[
    r"ignore\s+(all\s+)?previous\s+instructions",
    r"disregard\s+(all\s+)?prior\s+(instructions|rules|guidelines)",
    r"forget\s+(everything|all)\s+(above|before|prior)",
    r"you\s+are\s+now\s+(a|an)\s+",
    r"new\s+instructions?\s*:",
    r"system\s*prompt\s*:",
    r"override\s+(system|safety|security)",
    r"jailbreak",
    r"DAN\s+mode",
    r"developer\s+mode\s+(enabled|activated|on)",
    r"\[SYSTEM\]",
    r"\[INST\]",
    r"<\|im_start\|>",
    r"<\|im_end\|>",
    r"<\|system\|>",
    r"```system",
];

/// A sanitized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedInput {
    pub text: String,
    /// Number of injection phrases replaced.
    pub filtered: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct InputGuard {
    max_chars: usize,
    patterns: Vec<Regex>,
}

impl InputGuard {
    pub fn new(max_chars: usize) -> Result<Self> {
        let patterns = INJECTION_PATTERNS
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| AgentError::Internal(format!("bad guard pattern `{p}`: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            max_chars,
            patterns,
        })
    }

    /// Sanitize `input`. Empty results are a policy error.
    pub fn sanitize(&self, input: &str) -> Result<GuardedInput> {
        let stripped: String = input
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();
        let mut text = collapse_whitespace(&stripped);

        let mut filtered = 0;
        for pattern in &self.patterns {
            let hits = pattern.find_iter(&text).count();
            if hits > 0 {
                filtered += hits;
                text = pattern.replace_all(&text, FILTERED).into_owned();
            }
        }
        if filtered > 0 {
            tracing::warn!(filtered, "prompt injection phrases filtered");
        }

        let truncated = text.chars().count() > self.max_chars;
        if truncated {
            tracing::warn!(max_chars = self.max_chars, "input truncated");
            text = text.chars().take(self.max_chars).collect();
            text.truncate(text.trim_end().len());
        }

        if text.is_empty() {
            return Err(AgentError::EmptyInput);
        }
        Ok(GuardedInput {
            text,
            filtered,
            truncated,
        })
    }
}

/// Collapse runs of horizontal whitespace to one space per line and keep at
/// most one blank line in a row.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&collapsed);
    }
    out.trim().to_owned()
}

// ── tests ────────────────────────────────────────────────────────────
