//! `shell` tool: run a command in the workspace.
//!
//! Supports command allowlisting, workspace scoping, and a timeout layered
//! under the caller's cancellation token.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use turnloop_core::error::ToolError;
use turnloop_core::tool::{Tool, ToolResult};

const NAME: &str = "shell";
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Execute shell commands with safety constraints.
pub struct ShellTool {
    /// If non-empty, only these commands are allowed.
    allowed_commands: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl ShellTool {
    pub fn new(workdir: impl Into<PathBuf>, allowed_commands: Vec<String>) -> Self {
        Self {
            allowed_commands,
            workdir: workdir.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }

        // Every segment of a pipeline or chain must be allowed
        command
            .split(['|', ';', '&', '\n'])
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .all(|segment| {
                let base = segment.split_whitespace().next().unwrap_or("");
                self.allowed_commands.iter().any(|a| a == base)
            })
    }
}

fn clip(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n[output truncated]");
    }
    text
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return stdout/stderr. Use this for \
         listing files, searching, git operations, and running builds."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        cancel: CancellationToken,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        let command = arguments["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: NAME.into(),
                reason: format!("Command '{command}' is not in the allowlist"),
            });
        }

        debug!(command = %command, timeout_secs = self.timeout.as_secs(), "Executing shell command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut cmd = Command::new("cmd");
            cmd.args(["/C", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        };
        let child = cmd
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: NAME.into(),
                reason: e.to_string(),
            })?;

        // Dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(command = %command, "Shell command cancelled");
                return Ok(ToolResult::error("Command cancelled"));
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(command = %command, "Shell command timed out");
                return Err(ToolError::Timeout {
                    tool_name: NAME.into(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
            output = child.wait_with_output() => output.map_err(|e| ToolError::ExecutionFailed {
                tool_name: NAME.into(),
                reason: e.to_string(),
            })?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            let text = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                format!("{}\n[stderr]: {}", stdout.trim(), stderr.trim())
            };
            Ok(ToolResult::text(clip(text)))
        } else {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            let text = format!("[exit code: {code}]\n{}\n{}", stdout.trim(), stderr.trim());
            Ok(ToolResult::error(clip(text.trim().to_string())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnloop_core::message::ContentBlock;

    fn text_of(result: &ToolResult) -> &str {
        match &result.content[0] {
            ContentBlock::Text { text } => text,
            other => panic!("Expected text block, got {other:?}"),
        }
    }

    fn open_tool() -> ShellTool {
        ShellTool::new(std::env::temp_dir(), vec![])
    }

    #[test]
    fn allowlist_check() {
        let tool = ShellTool::new(".", vec!["ls".into(), "cat".into(), "git".into()]);
        assert!(tool.is_command_allowed("ls -la"));
        assert!(tool.is_command_allowed("cat file.txt"));
        assert!(tool.is_command_allowed("git status"));
        assert!(tool.is_command_allowed("git log | cat"));
        assert!(!tool.is_command_allowed("rm -rf /"));
        assert!(!tool.is_command_allowed("ls; rm -rf /"));
        assert!(!tool.is_command_allowed("cat x && sudo something"));
    }

    #[test]
    fn empty_allowlist_allows_all() {
        let tool = ShellTool::new(".", vec![]);
        assert!(tool.is_command_allowed("anything goes"));
    }

    #[tokio::test]
    async fn execute_echo() {
        let result = open_tool()
            .execute(
                CancellationToken::new(),
                serde_json::json!({"command": "echo hello"}),
            )
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(text_of(&result), "hello");
    }

    #[tokio::test]
    async fn runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let tool = ShellTool::new(dir.path(), vec![]);
        let result = tool
            .execute(CancellationToken::new(), serde_json::json!({"command": "ls"}))
            .await
            .unwrap();
        assert!(text_of(&result).contains("marker.txt"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_error_result() {
        let result = open_tool()
            .execute(
                CancellationToken::new(),
                serde_json::json!({"command": "echo oops >&2; exit 3"}),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        let text = text_of(&result);
        assert!(text.starts_with("[exit code: 3]"));
        assert!(text.contains("oops"));
    }

    #[tokio::test]
    async fn blocked_command() {
        let tool = ShellTool::new(".", vec!["ls".into()]);
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({"command": "rm -rf /"}),
            )
            .await;
        assert!(matches!(result, Err(ToolError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn missing_command_argument() {
        let result = open_tool()
            .execute(CancellationToken::new(), serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn timeout_kills_command() {
        let tool = open_tool().with_timeout(Duration::from_millis(100));
        let result = tool
            .execute(
                CancellationToken::new(),
                serde_json::json!({"command": "sleep 5"}),
            )
            .await;
        assert!(matches!(result, Err(ToolError::Timeout { .. })));
    }

    #[tokio::test]
    async fn cancellation_stops_command() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result = open_tool()
            .execute(cancel, serde_json::json!({"command": "sleep 5"}))
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(text_of(&result), "Command cancelled");
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
