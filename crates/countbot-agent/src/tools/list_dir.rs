//! Tool: list_dir — list a directory inside the workspace.

use std::path::PathBuf;

use async_trait::async_trait;

use super::workspace::resolve_path;
use super::{Tool, ToolResult};

pub struct ListDirTool {
    workspace: PathBuf,
    restrict: bool,
}

impl ListDirTool {
    pub fn new(workspace: PathBuf, restrict: bool) -> Self {
        Self { workspace, restrict }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories are suffixed with '/'."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path, relative to the workspace. Defaults to the workspace root."
                }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let path = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");

        let resolved = match resolve_path(&self.workspace, path, self.restrict) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let entries = match std::fs::read_dir(&resolved) {
            Ok(e) => e,
            Err(e) => return ToolResult::error(format!("failed to list '{path}': {e}")),
        };

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if e.path().is_dir() {
                    format!("{name}/")
                } else {
                    name
                }
            })
            .collect();
        names.sort();

        if names.is_empty() {
            ToolResult::success("(empty directory)")
        } else {
            ToolResult::success(names.join("\n"))
        }
    }
}
