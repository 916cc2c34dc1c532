//! Built-in tools for Converse: web search, page scraping, workspace files,
//! system information, command execution and the fact store.
//!
//! [`builtin_tools`] registers every tool the configuration enables into a
//! [`ToolRegistry`] and hands back the web search client, which also serves
//! as the retrieval engine's [`converse_agent::WebSearch`] collaborator.

pub mod browser;
pub mod filesystem;
pub mod html;
pub mod memory_tools;
pub mod system;
pub mod web_search;

use std::sync::Arc;

use converse_agent::{AppConfig, Tool, ToolError, ToolRegistry};
use converse_store::MemoryStore;

pub use browser::ScrapeUrlTool;
pub use filesystem::{ListDirTool, ReadFileTool, Workspace, WriteFileTool};
pub use memory_tools::{GetFactTool, SetFactTool};
pub use system::{Blocklist, ExecuteCommandTool, SystemInfoTool};
pub use web_search::WebSearchTool;

/// Owner used by the fact tools when a plan does not name one.
pub const DEFAULT_FACT_OWNER: &str = "default";

/// The registry of enabled tools plus the shared search client.
pub struct Builtins {
    pub registry: ToolRegistry,
    pub search: Arc<WebSearchTool>,
}

/// Build every enabled built-in tool.
///
/// Disabled tools (`[tools.enabled]`) are left out of the registry entirely;
/// plan-tier filtering happens later, per request.
pub fn builtin_tools(config: &AppConfig, store: Arc<dyn MemoryStore>) -> Result<Builtins, ToolError> {
    let search = Arc::new(WebSearchTool::from_env()?);
    let workspace = Arc::new(Workspace::new(&config.tools.workspace_root).map_err(|e| {
        ToolError::Registration {
            tool: "files.*".into(),
            reason: format!(
                "cannot open workspace {}: {e}",
                config.tools.workspace_root.display()
            ),
        }
    })?);

    let candidates: Vec<Arc<dyn Tool>> = vec![
        search.clone(),
        Arc::new(ScrapeUrlTool::new()?),
        Arc::new(ReadFileTool::new(Arc::clone(&workspace))),
        Arc::new(WriteFileTool::new(Arc::clone(&workspace))),
        Arc::new(ListDirTool::new(Arc::clone(&workspace))),
        Arc::new(SystemInfoTool::new()),
        Arc::new(ExecuteCommandTool::new(workspace.root(), config.tool_timeout())?),
        Arc::new(SetFactTool::new(Arc::clone(&store), DEFAULT_FACT_OWNER)),
        Arc::new(GetFactTool::new(store, DEFAULT_FACT_OWNER)),
    ];

    let mut registry = ToolRegistry::new();
    for tool in candidates {
        if !config.tool_enabled(tool.name()) {
            tracing::info!(tool = tool.name(), "tool disabled by configuration");
            continue;
        }
        registry.register(tool)?;
    }
    tracing::info!(
        tools = registry.len(),
        search_engine = search.engine(),
        "built-in tools registered"
    );

    Ok(Builtins { registry, search })
}
