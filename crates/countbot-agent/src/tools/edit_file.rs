//! Tool: edit_file — replace an exact text fragment in a file.

use std::path::PathBuf;

use async_trait::async_trait;

use super::workspace::resolve_path;
use super::{Tool, ToolResult};

pub struct EditFileTool {
    workspace: PathBuf,
    restrict: bool,
}

impl EditFileTool {
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact occurrence of `old` with `new` in a file. The `old` \
         text must appear exactly once."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace."
                },
                "old": {
                    "type": "string",
                    "description": "Exact text to replace (must match once)."
                },
                "new": {
                    "type": "string",
                    "description": "Replacement text."
                }
            },
            "required": ["path", "old", "new"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: path");
        };
        let Some(old) = input.get("old").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: old");
        };
        let Some(new) = input.get("new").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: new");
        };

        let resolved = match resolve_path(&self.workspace, path, self.restrict) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let content = match std::fs::read_to_string(&resolved) {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("failed to read '{path}': {e}")),
        };

        let occurrences = content.matches(old).count();
        if occurrences == 0 {
            return ToolResult::error(format!("text not found in '{path}'"));
        }
        if occurrences > 1 {
            return ToolResult::error(format!(
                "text appears {occurrences} times in '{path}'; provide a longer unique fragment"
            ));
        }

        let updated = content.replacen(old, new, 1);
        match std::fs::write(&resolved, updated) {
            Ok(()) => ToolResult::success(format!("Edited {path}")),
            Err(e) => ToolResult::error(format!("failed to write '{path}': {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn replaces_a_unique_fragment() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "hello world").unwrap();
        let tool = EditFileTool::new(dir.path().to_path_buf(), true);
        let result = tool
            .execute(
                serde_json::json!({"path": "f.txt", "old": "world", "new": "rust"}),
                None,
            )
            .await;
        assert!(!result.is_error);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "hello rust"
        );
    }

    #[tokio::test]
    async fn ambiguous_fragment_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "aa aa").unwrap();
        let tool = EditFileTool::new(dir.path().to_path_buf(), true);
        let result = tool
            .execute(
                serde_json::json!({"path": "f.txt", "old": "aa", "new": "b"}),
                None,
            )
            .await;
        assert!(result.is_error);
        assert!(result.content.contains("2 times"));
    }

    #[tokio::test]
    async fn missing_fragment_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), "abc").unwrap();
        let tool = EditFileTool::new(dir.path().to_path_buf(), true);
        let result = tool
            .execute(
                serde_json::json!({"path": "f.txt", "old": "zzz", "new": "y"}),
                None,
            )
            .await;
        assert!(result.is_error);
    }
}
