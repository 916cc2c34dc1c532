//! `memory.set_fact` and `memory.get_fact`: the fact store as plan tools.
//!
//! Facts are keyed by `(owner, key)`. Plans rarely know the owner, so both
//! tools fall back to the owner they were built with.

use std::sync::Arc;

use async_trait::async_trait;
use converse_agent::{Tool, ToolError};
use converse_store::MemoryStore;
use serde_json::{Value, json};
use tracing::debug;

/// Longest accepted fact key.
const MAX_KEY_CHARS: usize = 64;

/// Longest accepted fact value.
const MAX_VALUE_CHARS: usize = 2_000;

fn owner_of<'a>(arguments: &'a Value, default: &'a str) -> &'a str {
    arguments["owner"]
        .as_str()
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .unwrap_or(default)
}

fn key_of<'a>(arguments: &'a Value, tool: &str) -> Result<&'a str, ToolError> {
    let key = arguments["key"]
        .as_str()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ToolError::invalid(tool, "missing `key`"))?;
    if key.chars().count() > MAX_KEY_CHARS {
        return Err(ToolError::invalid(tool, format!("key longer than {MAX_KEY_CHARS} characters")));
    }
    Ok(key)
}

// ═══════════════════════════════════════════════════════════════════════
//  memory.set_fact
// ═══════════════════════════════════════════════════════════════════════

pub struct SetFactTool {
    store: Arc<dyn MemoryStore>,
    default_owner: String,
}

impl SetFactTool {
    pub fn new(store: Arc<dyn MemoryStore>, default_owner: impl Into<String>) -> Self {
        Self {
            store,
            default_owner: default_owner.into(),
        }
    }
}

#[async_trait]
impl Tool for SetFactTool {
    fn name(&self) -> &str {
        "memory.set_fact"
    }

    fn description(&self) -> &str {
        "Remember a fact about the user under a short key, replacing any previous value."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string", "description": "Short identifier such as `city`"},
                "value": {"type": "string"},
                "owner": {"type": "string"}
            },
            "required": ["key", "value"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let tool = self.name();
        let key = key_of(&arguments, tool)?;
        let value = arguments["value"]
            .as_str()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ToolError::invalid(tool, "missing `value`"))?;
        if value.chars().count() > MAX_VALUE_CHARS {
            return Err(ToolError::invalid(tool, format!("value longer than {MAX_VALUE_CHARS} characters")));
        }
        let owner = owner_of(&arguments, &self.default_owner);
        debug!(owner, key, "setting fact");

        let fact = self
            .store
            .set_fact(owner, key, value)
            .await
            .map_err(|e| ToolError::failed(tool, e))?;
        Ok(json!({
            "owner": fact.owner,
            "key": fact.key,
            "value": fact.value,
            "updated_at": fact.updated_at,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  memory.get_fact
// ═══════════════════════════════════════════════════════════════════════

pub struct GetFactTool {
    store: Arc<dyn MemoryStore>,
    default_owner: String,
}

impl GetFactTool {
    pub fn new(store: Arc<dyn MemoryStore>, default_owner: impl Into<String>) -> Self {
        Self {
            store,
            default_owner: default_owner.into(),
        }
    }
}

#[async_trait]
impl Tool for GetFactTool {
    fn name(&self) -> &str {
        "memory.get_fact"
    }

    fn description(&self) -> &str {
        "Look up a remembered fact by key. Without a key, list every fact."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string"},
                "owner": {"type": "string"}
            }
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let tool = self.name();
        let owner = owner_of(&arguments, &self.default_owner);

        if arguments["key"].is_null() {
            let facts = self
                .store
                .list_facts(owner)
                .await
                .map_err(|e| ToolError::failed(tool, e))?;
            let facts: serde_json::Map<String, Value> = facts
                .into_iter()
                .map(|f| (f.key, Value::String(f.value)))
                .collect();
            return Ok(json!({ "owner": owner, "facts": facts }));
        }

        let key = key_of(&arguments, tool)?;
        let fact = self
            .store
            .get_fact(owner, key)
            .await
            .map_err(|e| ToolError::failed(tool, e))?;
        Ok(json!({
            "owner": owner,
            "key": key,
            "found": fact.is_some(),
            "value": fact.map(|f| f.value),
        }))
    }
}
