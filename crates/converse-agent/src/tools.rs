//! Tool interface and registry.
//!
//! Tools are registered once at startup. Registration compiles each tool's
//! input schema (JSON Schema draft 7); invocations are validated against the
//! compiled schema before the tool runs. After startup the registry is only
//! read, so it is shared behind an `Arc` without locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use serde::Serialize;
use serde_json::Value;

use crate::error::ToolError;

/// A named capability the planner may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Registry key, e.g. `web_search` or `files.read_file`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn input_schema(&self) -> Value;

    /// Run the tool. Side effects are allowed; the executor never retries.
    async fn execute(&self, arguments: Value) -> Result<Value, ToolError>;
}

/// Public view of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

struct Registered {
    tool: Arc<dyn Tool>,
    descriptor: ToolDescriptor,
    schema: JSONSchema,
}

/// Name-keyed tool registry.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Registered>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, rejecting empty or duplicate names and schemas that
    /// are not object schemas or do not compile.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().trim().to_owned();
        if name.is_empty() {
            return Err(ToolError::Registration {
                tool: tool.name().to_owned(),
                reason: "name must not be empty".into(),
            });
        }
        if self.tools.contains_key(&name) {
            return Err(ToolError::Registration {
                tool: name,
                reason: "a tool with this name is already registered".into(),
            });
        }

        let schema_value = tool.input_schema();
        if schema_value.get("type").and_then(Value::as_str) != Some("object") {
            return Err(ToolError::Registration {
                tool: name,
                reason: "input schema must be an object schema".into(),
            });
        }
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_value)
            .map_err(|e| ToolError::Registration {
                tool: name.clone(),
                reason: format!("input schema does not compile: {e}"),
            })?;

        tracing::debug!(tool = %name, "tool registered");
        let descriptor = ToolDescriptor {
            name: name.clone(),
            description: tool.description().to_owned(),
            input_schema: schema_value,
        };
        self.tools.insert(
            name,
            Registered {
                tool,
                descriptor,
                schema,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| Arc::clone(&r.tool))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Sorted tool names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors sorted by name, optionally filtered.
    pub fn descriptors(&self, allowed: impl Fn(&str) -> bool) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .values()
            .filter(|r| allowed(&r.descriptor.name))
            .map(|r| r.descriptor.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Check `arguments` against the tool's compiled schema.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<(), ToolError> {
        let registered = self.tools.get(name).ok_or_else(|| ToolError::NotFound {
            tool: name.to_owned(),
        })?;
        if let Err(errors) = registered.schema.validate(arguments) {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect();
            return Err(ToolError::invalid(name, messages.join(", ")));
        }
        Ok(())
    }

    /// Validate and run one tool under `timeout`.
    pub async fn execute(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        self.validate(name, &arguments)?;
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound {
            tool: name.to_owned(),
        })?;
        match tokio::time::timeout(timeout, tool.execute(arguments)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: name.to_owned(),
                after: timeout,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Echo {
        name: &'static str,
        schema: Value,
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "Echoes its arguments"
        }

        fn input_schema(&self) -> Value {
            self.schema.clone()
        }

        async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
            Ok(arguments)
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn description(&self) -> &str {
            "Never finishes in time"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _arguments: Value) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    fn echo() -> Arc<dyn Tool> {
        Arc::new(Echo {
            name: "echo",
            schema: json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        })
    }

    #[test]
    fn rejects_duplicate_and_empty_names() {
        let mut registry = ToolRegistry::new();
        registry.register(echo()).unwrap();
        assert!(matches!(
            registry.register(echo()),
            Err(ToolError::Registration { .. })
        ));
        let blank = Arc::new(Echo {
            name: "  ",
            schema: json!({"type": "object"}),
        });
        assert!(registry.register(blank).is_err());
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[test]
    fn rejects_non_object_schema() {
        let mut registry = ToolRegistry::new();
        let tool = Arc::new(Echo {
            name: "bad",
            schema: json!({"type": "string"}),
        });
        assert!(registry.register(tool).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn validates_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(echo()).unwrap();
        registry.validate("echo", &json!({"text": "hi"})).unwrap();

        let err = registry.validate("echo", &json!({"text": 3})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
        assert!(err.to_string().contains("/text"));

        assert!(matches!(
            registry.validate("missing", &json!({})),
            Err(ToolError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn executes_with_timeout() {
        let mut registry = ToolRegistry::new();
        registry.register(echo()).unwrap();
        registry.register(Arc::new(Sleepy)).unwrap();

        let out = registry
            .execute("echo", json!({"text": "hi"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out["text"], "hi");

        let err = registry
            .execute("sleepy", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[test]
    fn descriptors_are_filtered_and_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Sleepy)).unwrap();
        registry.register(echo()).unwrap();
        let all: Vec<String> = registry.descriptors(|_| true).into_iter().map(|d| d.name).collect();
        assert_eq!(all, vec!["echo", "sleepy"]);
        let some = registry.descriptors(|n| n != "sleepy");
        assert_eq!(some.len(), 1);
    }
}
