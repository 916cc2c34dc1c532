//! File tools rooted at a workspace directory.
//!
//! Every path is resolved against [`Workspace::root`] and must stay inside
//! it after `.`/`..` normalization and symlink resolution. Well-known system
//! directories are refused even when the workspace root would contain them.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use converse_agent::{Tool, ToolError};
use serde_json::{Value, json};
use tracing::debug;

/// Characters returned per read before truncation.
const MAX_READ_CHARS: usize = 16_000;

/// Largest accepted write.
const MAX_WRITE_BYTES: usize = 1024 * 1024;

/// Entries returned per listing.
const MAX_LIST_ENTRIES: usize = 500;

const SYSTEM_PREFIXES: &[&str] = &[
    "/etc", "/proc", "/sys", "/dev", "/boot", "/bin", "/sbin", "/usr", "/var/run", "/root",
];

// ═══════════════════════════════════════════════════════════════════════
//  Workspace
// ═══════════════════════════════════════════════════════════════════════

/// The directory file tools operate in.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create the root if needed and pin its canonical form.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied path to an absolute path inside the root.
    pub fn resolve(&self, raw: &str, tool: &str) -> Result<PathBuf, ToolError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.contains('\0') {
            return Err(ToolError::invalid(tool, "path must be a non-empty string"));
        }

        let candidate = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.root.join(raw)
        };
        let normalized = normalize_path(&candidate);

        if is_system_path(&normalized) && !self.root_is_system() {
            return Err(ToolError::denied(tool, format!("`{raw}` is a system path")));
        }
        if !normalized.starts_with(&self.root) {
            return Err(ToolError::denied(
                tool,
                format!("`{raw}` resolves outside the workspace"),
            ));
        }

        // A symlink inside the root may still point outside it.
        if let Some(existing) = deepest_existing(&normalized)
            && let Ok(real) = existing.canonicalize()
            && !real.starts_with(&self.root)
        {
            return Err(ToolError::denied(
                tool,
                format!("`{raw}` escapes the workspace through a link"),
            ));
        }
        Ok(normalized)
    }

    fn root_is_system(&self) -> bool {
        is_system_path(&self.root)
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| path.display().to_string())
    }
}

/// Resolve `.` and `..` lexically; the target may not exist yet.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn deepest_existing(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

fn is_system_path(path: &Path) -> bool {
    SYSTEM_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
        || path
            .to_str()
            .is_some_and(|s| s.to_ascii_lowercase().starts_with("c:\\windows"))
}

fn require_str<'a>(arguments: &'a Value, field: &str, tool: &str) -> Result<&'a str, ToolError> {
    arguments[field]
        .as_str()
        .ok_or_else(|| ToolError::invalid(tool, format!("missing `{field}`")))
}

fn io_failure(tool: &str, path: &str, e: std::io::Error) -> ToolError {
    ToolError::failed(tool, format!("{path}: {e}"))
}

// ═══════════════════════════════════════════════════════════════════════
//  files.read_file
// ═══════════════════════════════════════════════════════════════════════

pub struct ReadFileTool {
    workspace: Arc<Workspace>,
}

impl ReadFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "files.read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let tool = self.name();
        let raw = require_str(&arguments, "path", tool)?;
        let path = self.workspace.resolve(raw, tool)?;
        debug!(path = %path.display(), "reading file");

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_failure(tool, raw, e))?;
        let total_chars = text.chars().count();
        let (content, truncated) = match text.char_indices().nth(MAX_READ_CHARS) {
            Some((cut, _)) => (format!("{}\n[... truncated]", &text[..cut]), true),
            None => (text, false),
        };

        Ok(json!({
            "path": self.workspace.display(&path),
            "content": content,
            "total_chars": total_chars,
            "truncated": truncated,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  files.write_file
// ═══════════════════════════════════════════════════════════════════════

pub struct WriteFileTool {
    workspace: Arc<Workspace>,
}

impl WriteFileTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "files.write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file in the workspace, creating parent directories. Overwrites by default."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"},
                "append": {"type": "boolean", "description": "Append instead of overwriting"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let tool = self.name();
        let raw = require_str(&arguments, "path", tool)?;
        let content = require_str(&arguments, "content", tool)?;
        let append = arguments["append"].as_bool().unwrap_or(false);
        if content.len() > MAX_WRITE_BYTES {
            return Err(ToolError::invalid(
                tool,
                format!("content exceeds {MAX_WRITE_BYTES} bytes"),
            ));
        }

        let path = self.workspace.resolve(raw, tool)?;
        if path == self.workspace.root() {
            return Err(ToolError::invalid(tool, "cannot write to the workspace root"));
        }
        debug!(path = %path.display(), append, bytes = content.len(), "writing file");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_failure(tool, raw, e))?;
        }
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| io_failure(tool, raw, e))?;
            file.write_all(content.as_bytes())
                .await
                .map_err(|e| io_failure(tool, raw, e))?;
            file.flush().await.map_err(|e| io_failure(tool, raw, e))?;
        } else {
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| io_failure(tool, raw, e))?;
        }
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_failure(tool, raw, e))?
            .len();

        Ok(json!({
            "path": self.workspace.display(&path),
            "size_bytes": size,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  files.list_dir
// ═══════════════════════════════════════════════════════════════════════

pub struct ListDirTool {
    workspace: Arc<Workspace>,
}

impl ListDirTool {
    pub fn new(workspace: Arc<Workspace>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "files.list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a workspace directory."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory relative to the workspace (default: root)"}
            }
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let tool = self.name();
        let raw = arguments["path"].as_str().unwrap_or(".");
        let path = self.workspace.resolve(raw, tool)?;

        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| io_failure(tool, raw, e))?;
        let mut entries = Vec::new();
        let mut total = 0usize;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| io_failure(tool, raw, e))?
        {
            total += 1;
            if entries.len() >= MAX_LIST_ENTRIES {
                continue;
            }
            let meta = entry.metadata().await.ok();
            let is_dir = meta.as_ref().is_some_and(|m| m.is_dir());
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "kind": if is_dir { "dir" } else { "file" },
                "size_bytes": meta.filter(|m| m.is_file()).map(|m| m.len()),
            }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

        Ok(json!({
            "path": self.workspace.display(&path),
            "entries": entries,
            "total": total,
            "truncated": total > entries.len(),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
