//! Research planner.
//!
//! Asks the Provider Router (non-streaming) to decompose a goal into an
//! ordered list of tool invocations plus a synthesis instruction. The plan
//! is advisory: the executor re-checks every step against the registry.
//! A plan that cannot be produced or parsed degrades to an empty plan whose
//! synthesis is the goal itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AgentError, ErrorKind, Result};
use crate::llm::router::{ProviderRouter, RouteRequest};
use crate::llm::types::{Message, ProviderTarget};
use crate::tools::ToolDescriptor;

const MAX_STEPS: usize = 6;

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// An ordered set of tool invocations for one goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    /// Instruction for the final streamed synthesis call.
    pub synthesis: String,
    /// Why the planner fell back to a direct answer, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

/// One tool invocation descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: u32,
    pub tool: String,
    /// May contain `{{step_N.output}}` placeholders.
    pub arguments: Value,
    /// A failed required step skips the rest of the plan.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl Plan {
    /// No tool steps; the synthesis answers the goal directly.
    pub fn direct(goal: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            goal: goal.to_owned(),
            steps: Vec::new(),
            synthesis: goal.to_owned(),
            degraded: None,
        }
    }

    /// A direct plan standing in for one that could not be produced.
    pub fn degraded(goal: &str, reason: impl Into<String>) -> Self {
        Self {
            degraded: Some(reason.into()),
            ..Self::direct(goal)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

/// Decomposes goals into plans using the router.
pub struct Planner {
    router: Arc<ProviderRouter>,
}

impl Planner {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self { router }
    }

    /// Produce a plan for `goal` using only `tools`.
    ///
    /// Cancellation and policy errors propagate; every other failure
    /// degrades to [`Plan::degraded`]. Without tools the plan is
    /// [`Plan::direct`].
    pub async fn plan(
        &self,
        goal: &str,
        tools: &[ToolDescriptor],
        context: Option<&str>,
        target: Option<ProviderTarget>,
        tier: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        if tools.is_empty() {
            return Ok(Plan::direct(goal));
        }

        let request = RouteRequest {
            messages: vec![
                Message::system(build_system_prompt(tools)),
                Message::user(build_user_prompt(goal, context)),
            ],
            target,
            tier,
            temperature: Some(0.0),
        };

        let generation = match self.router.complete(&request, cancel).await {
            Ok(generation) => generation,
            Err(e) if matches!(e.kind(), ErrorKind::Cancelled | ErrorKind::Policy) => {
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "planning call failed, answering directly");
                return Ok(Plan::degraded(goal, format!("planning failed: {e}")));
            }
        };

        match parse_plan(goal, &generation.text) {
            Ok(plan) => {
                tracing::info!(
                    plan_id = %plan.id,
                    step_count = plan.steps.len(),
                    served_by = %generation.served_by,
                    "plan generated"
                );
                Ok(plan)
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable plan, answering directly");
                Ok(Plan::degraded(goal, format!("unparseable plan: {e}")))
            }
        }
    }
}

fn build_system_prompt(tools: &[ToolDescriptor]) -> String {
    let tool_list: String = tools
        .iter()
        .map(|t| format!("- `{}`: {}\n  arguments schema: {}", t.name, t.description, t.input_schema))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are a research planner. Decompose the user's goal into at most {MAX_STEPS} tool calls that gather what is needed to answer it.

## Available Tools
{tool_list}

## Output Format
Respond with JSON only, in this exact structure:
{{
  "steps": [
    {{
      "tool": "name_of_tool",
      "arguments": {{}},
      "required": false,
      "description": "What this step gathers"
    }}
  ],
  "synthesis": "How to combine the step outputs into the final answer"
}}

## Rules
- Use only the tools listed above, with arguments matching their schema.
- Mark a step "required" only if later steps are useless without it.
- Arguments may reference earlier outputs with {{{{step_N.output}}}} (N is zero-based).
- If no tool is needed, return an empty "steps" array."#,
    )
}

fn build_user_prompt(goal: &str, context: Option<&str>) -> String {
    let mut prompt = format!("Goal:\n{goal}");
    if let Some(ctx) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str(&format!("\n\nContext:\n{ctx}"));
    }
    prompt
}

/// Parse the model's JSON response into a [`Plan`].
fn parse_plan(goal: &str, text: &str) -> Result<Plan> {
    let json_str = extract_json_block(text);
    let v: Value = serde_json::from_str(json_str).map_err(|e| AgentError::InvalidRequest {
        reason: format!("plan is not JSON: {e}"),
    })?;

    let steps_value = v["steps"]
        .as_array()
        .ok_or_else(|| AgentError::InvalidRequest {
            reason: "plan JSON missing `steps` array".into(),
        })?;

    let mut steps = Vec::with_capacity(steps_value.len().min(MAX_STEPS));
    for (i, sv) in steps_value.iter().take(MAX_STEPS).enumerate() {
        let tool = sv["tool"]
            .as_str()
            .or_else(|| sv["tool_name"].as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AgentError::InvalidRequest {
                reason: format!("step {i} has no tool"),
            })?;
        let arguments = match &sv["arguments"] {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        steps.push(PlanStep {
            index: i as u32,
            tool: tool.to_owned(),
            arguments,
            required: sv["required"].as_bool().unwrap_or(false),
            description: sv["description"].as_str().unwrap_or_default().to_owned(),
        });
    }

    let synthesis = v["synthesis"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(goal)
        .to_owned();

    Ok(Plan {
        id: Uuid::now_v7(),
        goal: goal.to_owned(),
        steps,
        synthesis,
        degraded: None,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract a JSON block from text that might be wrapped in markdown fences.
fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let json_start = start + 7; // len("```json")
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let json_start = start + 3;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    // Prose around a bare object.
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        return &trimmed[start..=end];
    }

    trimmed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
