//! `system.get_system_info` and `system.execute_command`.
//!
//! Command execution runs through the platform shell in the workspace
//! directory with a timeout; the child is killed when the timeout fires.
//! A blocklist refuses obviously destructive commands before spawning.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use converse_agent::{Tool, ToolError};
use regex::RegexSet;
use serde_json::{Value, json};
use tracing::{info, warn};

/// Bytes kept from each of stdout and stderr.
const MAX_OUTPUT_BYTES: usize = 16 * 1024;

/// Per-command timeout ceiling regardless of what the caller asks for.
const MAX_TIMEOUT: Duration = Duration::from_secs(120);

/// Destructive patterns, matched case-insensitively against the command.
const BLOCKED_PATTERNS: &[&str] = &[
    r"\brm\s+(-[a-z]*r[a-z]*f|-[a-z]*f[a-z]*r)\b",
    r"\brm\s+-r\s+-f\b|\brm\s+-f\s+-r\b",
    r"\bdel\s+/f\b",
    r"\bformat\s+[a-z]:",
    r"\bformat\b\s*$",
    r"\bshutdown\b",
    r"\breboot\b",
    r"\bmkfs(\.\w+)?\b",
    r"\bdd\s+if=",
    r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r">\s*/dev/sd[a-z]",
];

/// Compiled [`BLOCKED_PATTERNS`].
#[derive(Debug, Clone)]
pub struct Blocklist {
    set: RegexSet,
}

impl Blocklist {
    pub fn new() -> Result<Self, ToolError> {
        let set = RegexSet::new(BLOCKED_PATTERNS.iter().map(|p| format!("(?i){p}"))).map_err(|e| {
            ToolError::Registration {
                tool: "system.execute_command".into(),
                reason: format!("invalid blocklist pattern: {e}"),
            }
        })?;
        Ok(Self { set })
    }

    /// Why `command` is refused, if it is.
    pub fn reason(&self, command: &str) -> Option<String> {
        self.set
            .matches(command)
            .iter()
            .next()
            .map(|i| format!("command matches blocked pattern `{}`", BLOCKED_PATTERNS[i]))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  system.get_system_info
// ═══════════════════════════════════════════════════════════════════════

pub struct SystemInfoTool {
    started: Instant,
}

impl SystemInfoTool {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemInfoTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SystemInfoTool {
    fn name(&self) -> &str {
        "system.get_system_info"
    }

    fn description(&self) -> &str {
        "Report the host operating system, architecture, CPU count and current time."
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: Value) -> Result<Value, ToolError> {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        let now = chrono::Local::now();
        Ok(json!({
            "os": std::env::consts::OS,
            "family": std::env::consts::FAMILY,
            "arch": std::env::consts::ARCH,
            "cpus": cpus,
            "local_time": now.to_rfc3339(),
            "timezone_offset": now.offset().to_string(),
            "service_uptime_secs": self.started.elapsed().as_secs(),
            "service_version": env!("CARGO_PKG_VERSION"),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  system.execute_command
// ═══════════════════════════════════════════════════════════════════════

pub struct ExecuteCommandTool {
    working_dir: PathBuf,
    timeout: Duration,
    blocklist: Blocklist,
}

impl ExecuteCommandTool {
    pub fn new(working_dir: impl Into<PathBuf>, timeout: Duration) -> Result<Self, ToolError> {
        Ok(Self {
            working_dir: working_dir.into(),
            timeout: timeout.min(MAX_TIMEOUT),
            blocklist: Blocklist::new()?,
        })
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "system.execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace and return its exit code, stdout and stderr."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "minLength": 1},
                "timeout_secs": {"type": "integer", "minimum": 1, "maximum": MAX_TIMEOUT.as_secs()}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        let tool = self.name();
        let command = arguments["command"]
            .as_str()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ToolError::invalid(tool, "missing `command`"))?;
        if let Some(reason) = self.blocklist.reason(command) {
            warn!(command, %reason, "blocked command");
            return Err(ToolError::denied(tool, reason));
        }
        let timeout = arguments["timeout_secs"]
            .as_u64()
            .map_or(self.timeout, |s| Duration::from_secs(s).min(MAX_TIMEOUT));

        let mut cmd = if cfg!(windows) {
            let mut c = tokio::process::Command::new("cmd");
            c.arg("/C");
            c
        } else {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c");
            c
        };
        let child = cmd
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::failed(tool, format!("failed to spawn: {e}")))?;

        let started = Instant::now();
        // On timeout the future is dropped, which kills the child.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ToolError::failed(tool, format!("process error: {e}")))?,
            Err(_) => {
                warn!(command, timeout_secs = timeout.as_secs(), "command timed out");
                return Err(ToolError::Timeout {
                    tool: tool.to_owned(),
                    after: timeout,
                });
            }
        };

        let exit_code = output.status.code();
        let (stdout, stdout_truncated) = truncate_output(&output.stdout);
        let (stderr, stderr_truncated) = truncate_output(&output.stderr);
        info!(
            command,
            exit_code = exit_code.unwrap_or(-1),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );

        Ok(json!({
            "exit_code": exit_code,
            "success": output.status.success(),
            "stdout": stdout,
            "stderr": stderr,
            "truncated": stdout_truncated || stderr_truncated,
        }))
    }
}

fn truncate_output(raw: &[u8]) -> (String, bool) {
    if raw.len() <= MAX_OUTPUT_BYTES {
        return (String::from_utf8_lossy(raw).into_owned(), false);
    }
    let mut text = String::from_utf8_lossy(&raw[..MAX_OUTPUT_BYTES]).into_owned();
    text.push_str("\n[... output truncated]");
    (text, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklist_catches_destructive_commands() {
        let blocklist = Blocklist::new().unwrap();
        for cmd in [
            "rm -rf /",
            "sudo rm -fr ~/",
            "RM -RF /tmp/x",
            "rm -r -f build",
            "del /f C:\\file",
            "format c:",
            "shutdown -h now",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            ":(){ :|:& };:",
        ] {
            assert!(blocklist.reason(cmd).is_some(), "{cmd}");
        }
        for cmd in ["ls -la", "echo formatted", "cargo --version", "rm notes.txt", "grep -rf pattern ."] {
            assert!(blocklist.reason(cmd).is_none(), "{cmd}");
        }
    }

    #[test]
    fn output_is_truncated() {
        let (text, cut) = truncate_output(&vec![b'a'; MAX_OUTPUT_BYTES + 1]);
        assert!(cut);
        assert!(text.ends_with("[... output truncated]"));
    }

    #[tokio::test]
    async fn system_info_reports_platform() {
        let out = SystemInfoTool::new().execute(json!({})).await.unwrap();
        assert_eq!(out["os"], std::env::consts::OS);
        assert!(out["cpus"].as_u64().unwrap() >= 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_commands_in_the_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let tool = ExecuteCommandTool::new(dir.path(), Duration::from_secs(5)).unwrap();

        let out = tool.execute(json!({"command": "ls"})).await.unwrap();
        assert_eq!(out["exit_code"], 0);
        assert!(out["stdout"].as_str().unwrap().contains("marker.txt"));

        let out = tool.execute(json!({"command": "exit 3"})).await.unwrap();
        assert_eq!(out["success"], false);
        assert_eq!(out["exit_code"], 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_commands_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecuteCommandTool::new(dir.path(), Duration::from_secs(1)).unwrap();
        let err = tool.execute(json!({"command": "sleep 5"})).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn blocked_commands_are_denied() {
        let tool = ExecuteCommandTool::new(".", Duration::from_secs(1)).unwrap();
        let err = tool.execute(json!({"command": "rm -rf /"})).await.unwrap_err();
        assert!(matches!(err, ToolError::Denied { .. }));
    }
}
