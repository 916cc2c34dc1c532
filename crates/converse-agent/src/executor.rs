//! Plan executor.
//!
//! Runs a [`Plan`] step by step against the [`ToolRegistry`]. Steps are
//! sequential so later steps can consume earlier outputs through
//! `{{step_N.output}}` placeholders. A failed step is recorded and the plan
//! continues, unless the step was marked required, in which case every
//! remaining step is skipped. Tools are never retried here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AgentError, Result, ToolError};
use crate::planner::{Plan, PlanStep};
use crate::retrieval::truncate_chars;
use crate::tools::ToolRegistry;
use crate::turn::TurnEvent;

/// Characters of each step output carried into the synthesis prompt.
const FINDING_CHARS: usize = 2_000;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    /// Not run because an earlier required step failed.
    Skipped,
}

/// Record of one attempted tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub index: u32,
    pub tool: String,
    /// Arguments after placeholder substitution.
    pub arguments: Value,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Aggregated result of a plan run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanReport {
    pub invocations: Vec<ToolInvocation>,
    /// Index of the required step whose failure stopped the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<u32>,
}

impl PlanReport {
    pub fn completed(&self) -> usize {
        self.invocations
            .iter()
            .filter(|i| i.status == StepStatus::Completed)
            .count()
    }

    /// Step outputs and errors rendered for the synthesis prompt.
    pub fn findings(&self) -> String {
        self.invocations
            .iter()
            .filter_map(|inv| {
                let body = match inv.status {
                    StepStatus::Completed => {
                        truncate_chars(&output_text(inv.output.as_ref()), FINDING_CHARS)
                    }
                    StepStatus::Failed => {
                        format!("failed: {}", inv.error.as_deref().unwrap_or("unknown error"))
                    }
                    StepStatus::Skipped => return None,
                };
                Some(format!("[step {}] {}:\n{}", inv.index, inv.tool, body))
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Executes plans against a shared registry.
pub struct PlanExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl PlanExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run every step of `plan` in order.
    ///
    /// `allowed` gates tools by enablement and plan tier. Progress goes to
    /// `events` as `tool_started` / `tool_finished`. Only cancellation is an
    /// error; tool failures are recorded in the report.
    pub async fn execute<F>(
        &self,
        plan: &Plan,
        allowed: F,
        events: &mpsc::Sender<TurnEvent>,
        turn_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<PlanReport>
    where
        F: Fn(&str) -> bool + Sync,
    {
        let mut outputs: HashMap<u32, String> = HashMap::new();
        let mut report = PlanReport::default();

        for step in &plan.steps {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            if let Some(failed) = report.aborted_at {
                report.invocations.push(ToolInvocation {
                    index: step.index,
                    tool: step.tool.clone(),
                    arguments: step.arguments.clone(),
                    status: StepStatus::Skipped,
                    output: None,
                    error: Some(format!("required step {failed} failed")),
                    duration_ms: 0,
                });
                continue;
            }

            let arguments = resolve_placeholders(&step.arguments, &outputs);
            emit(
                events,
                cancel,
                TurnEvent::ToolStarted {
                    turn_id,
                    step: step.index,
                    tool: step.tool.clone(),
                    description: step.description.clone(),
                },
            )
            .await?;

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                res = self.run_step(step, arguments.clone(), &allowed) => res,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let invocation = match result {
                Ok(output) => {
                    tracing::info!(step = step.index, tool = %step.tool, elapsed_ms = duration_ms, "step completed");
                    outputs.insert(step.index, output_text(Some(&output)));
                    ToolInvocation {
                        index: step.index,
                        tool: step.tool.clone(),
                        arguments,
                        status: StepStatus::Completed,
                        output: Some(output),
                        error: None,
                        duration_ms,
                    }
                }
                Err(e) => {
                    tracing::warn!(step = step.index, tool = %step.tool, required = step.required, error = %e, "step failed");
                    if step.required {
                        report.aborted_at = Some(step.index);
                    }
                    ToolInvocation {
                        index: step.index,
                        tool: step.tool.clone(),
                        arguments,
                        status: StepStatus::Failed,
                        output: None,
                        error: Some(e.to_string()),
                        duration_ms,
                    }
                }
            };

            emit(
                events,
                cancel,
                TurnEvent::ToolFinished {
                    turn_id,
                    step: invocation.index,
                    tool: invocation.tool.clone(),
                    ok: invocation.status == StepStatus::Completed,
                    duration_ms,
                    error: invocation.error.clone(),
                },
            )
            .await?;
            report.invocations.push(invocation);
        }

        Ok(report)
    }

    async fn run_step<F>(
        &self,
        step: &PlanStep,
        arguments: Value,
        allowed: &F,
    ) -> std::result::Result<Value, ToolError>
    where
        F: Fn(&str) -> bool + Sync,
    {
        if !self.registry.contains(&step.tool) {
            return Err(ToolError::NotFound {
                tool: step.tool.clone(),
            });
        }
        if !allowed(&step.tool) {
            return Err(ToolError::Unavailable {
                tool: step.tool.clone(),
                reason: "disabled or outside the plan tier".into(),
            });
        }
        self.registry
            .execute(&step.tool, arguments, self.timeout)
            .await
    }
}

/// Send a progress event; a closed receiver cancels the turn.
async fn emit(
    events: &mpsc::Sender<TurnEvent>,
    cancel: &CancellationToken,
    event: TurnEvent,
) -> Result<()> {
    if events.send(event).await.is_err() {
        cancel.cancel();
        return Err(AgentError::Cancelled);
    }
    Ok(())
}

/// Strings pass through; other values are rendered as JSON.
fn output_text(output: Option<&Value>) -> String {
    match output {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Placeholder resolution
// ---------------------------------------------------------------------------

/// Resolve `{{step_N.output}}` placeholders in a JSON value by substituting
/// the outputs of earlier steps. Unknown references stay as written.
fn resolve_placeholders(value: &Value, outputs: &HashMap<u32, String>) -> Value {
    match value {
        Value::String(s) => {
            let mut resolved = s.clone();
            for (index, output) in outputs {
                let placeholder = format!("{{{{step_{index}.output}}}}");
                if resolved.contains(&placeholder) {
                    resolved = resolved.replace(&placeholder, output);
                }
            }
            Value::String(resolved)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_placeholders(v, outputs)))
                .collect(),
        ),
        Value::Array(arr) => Value::Array(
            arr.iter()
                .map(|v| resolve_placeholders(v, outputs))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
