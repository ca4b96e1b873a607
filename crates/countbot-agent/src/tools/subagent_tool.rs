//! Tool: spawn_subagent — dispatch a background task to a restricted agent.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Tool, ToolResult};
use crate::subagent::SubagentManager;

pub struct SpawnSubagentTool {
    manager: Arc<SubagentManager>,
}

impl SpawnSubagentTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Dispatch a background task to a restricted subagent and return \
         immediately. Use for long-running research or multi-step side work; \
         check progress via the task list."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "label": {
                    "type": "string",
                    "description": "Short human-readable task label."
                },
                "message": {
                    "type": "string",
                    "description": "The full task instruction for the subagent."
                }
            },
            "required": ["label", "message"]
        })
    }

    async fn execute(&self, input: serde_json::Value, session_id: Option<&str>) -> ToolResult {
        let Some(label) = input.get("label").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: label");
        };
        let Some(message) = input.get("message").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: message");
        };

        let task_id = self.manager.spawn(label, message, session_id);
        ToolResult::success(format!(
            "后台任务已派发，id={task_id}。任务完成后可在任务列表中查看结果。"
        ))
    }
}
