//! Tool: exec_shell — run a one-shot shell command.
//!
//! Commands go through the safety checker first, run under a timeout, and
//! have their combined output clipped to `max_output_length`. Every attempt
//! is appended to the audit log when auditing is enabled, including blocked
//! and timed-out ones.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{info, warn};

use countbot_core::config::SecurityConfig;

use super::{Tool, ToolResult};
use crate::safety::check_command;

pub struct ExecShellTool {
    workspace: PathBuf,
    security: Arc<RwLock<SecurityConfig>>,
    audit_log: PathBuf,
}

impl ExecShellTool {
    pub fn new(workspace: PathBuf, security: Arc<RwLock<SecurityConfig>>) -> Self {
        let audit_log = workspace.join("audit.log");
        Self {
            workspace,
            security,
            audit_log,
        }
    }

    fn audit(&self, command: &str, verdict: &str) {
        let enabled = self
            .security
            .read()
            .map(|s| s.audit_log_enabled)
            .unwrap_or(false);
        if !enabled {
            return;
        }
        let line = format!(
            "{} | {} | {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            verdict,
            command.replace('\n', " ")
        );
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!("failed to write audit log: {e}");
        }
    }
}

#[async_trait]
impl Tool for ExecShellTool {
    fn name(&self) -> &str {
        "exec_shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return its output. \
         Long-running commands are killed at the timeout."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to run."
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (optional, defaults to the configured command timeout)."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let Some(command) = input.get("command").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: command");
        };

        let (timeout_secs, max_output) = {
            let sec = match self.security.read() {
                Ok(s) => s,
                Err(_) => return ToolResult::error("security config unavailable"),
            };
            if let Err(reason) = check_command(command, &sec) {
                drop(sec);
                self.audit(command, "BLOCKED");
                return ToolResult::error(format!("命令已被安全策略拒绝: {reason}"));
            }
            (sec.command_timeout, sec.max_output_length)
        };

        let timeout_secs = input
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(timeout_secs);

        self.audit(command, "RUN");
        info!(command = %command.chars().take(80).collect::<String>(), "exec_shell");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .output();

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            child,
        )
        .await
        {
            Err(_) => {
                self.audit(command, "TIMEOUT");
                return ToolResult::error(format!("command timed out after {timeout_secs}s"));
            }
            Ok(Err(e)) => return ToolResult::error(format!("failed to spawn command: {e}")),
            Ok(Ok(out)) => out,
        };

        let mut text = String::new();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&stderr);
        }

        if text.chars().count() > max_output {
            let clipped: String = text.chars().take(max_output).collect();
            text = format!("{clipped}\n\n[output truncated at {max_output} characters]");
        }

        if output.status.success() {
            if text.is_empty() {
                ToolResult::success("(command completed with no output)")
            } else {
                ToolResult::success(text)
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            ToolResult::error(format!("command exited with status {code}\n{text}"))
        }
    }
}
