//! Tool: read_file — read a file from the workspace.

use std::path::PathBuf;

use async_trait::async_trait;

use super::workspace::resolve_path;
use super::{Tool, ToolResult};

/// Maximum characters returned, to avoid flooding the context window.
const MAX_OUTPUT_CHARS: usize = 30_000;

pub struct ReadFileTool {
    workspace: PathBuf,
    restrict: bool,
}

impl ReadFileTool {
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file. Optionally limit to a line range with \
         `offset` (1-based first line) and `limit` (number of lines)."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace."
                },
                "offset": {
                    "type": "integer",
                    "description": "1-based line number to start from (optional)."
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (optional)."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };

        let resolved = match resolve_path(&self.workspace, path, self.restrict) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let content = match std::fs::read_to_string(&resolved) {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("failed to read '{path}': {e}")),
        };

        let offset = input
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|v| v.saturating_sub(1) as usize);
        let limit = input.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);

        let result = if offset.is_some() || limit.is_some() {
            let start = offset.unwrap_or(0);
            let lines: Vec<&str> = content.lines().skip(start).collect();
            let lines = if let Some(n) = limit {
                &lines[..n.min(lines.len())]
            } else {
                &lines[..]
            };
            lines.join("\n")
        } else {
            content
        };

        if result.chars().count() > MAX_OUTPUT_CHARS {
            let clipped: String = result.chars().take(MAX_OUTPUT_CHARS).collect();
            ToolResult::success(format!(
                "{clipped}\n\n[output truncated at {MAX_OUTPUT_CHARS} characters]"
            ))
        } else {
            ToolResult::success(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_file_contents() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), "hi").unwrap();
        let tool = ReadFileTool::new(dir.path().to_path_buf(), true);
        let result = tool
            .execute(serde_json::json!({"path": "readme.txt"}), None)
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn line_range_is_respected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\nc\nd").unwrap();
        let tool = ReadFileTool::new(dir.path().to_path_buf(), true);
        let result = tool
            .execute(
                serde_json::json!({"path": "f.txt", "offset": 2, "limit": 2}),
                None,
            )
            .await;
        assert_eq!(result.content, "b\nc");
    }

    #[tokio::test]
    async fn missing_file_reports_error() {
        let dir = TempDir::new().unwrap();
        let tool = ReadFileTool::new(dir.path().to_path_buf(), true);
        let result = tool
            .execute(serde_json::json!({"path": "ghost.txt"}), None)
            .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn workspace_escape_is_blocked() {
        let dir = TempDir::new().unwrap();
        let tool = ReadFileTool::new(dir.path().to_path_buf(), true);
        let result = tool
            .execute(serde_json::json!({"path": "../../etc/passwd"}), None)
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("outside the workspace"));
    }
}
