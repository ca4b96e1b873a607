//! Tools binding the agent to the long-term memory store.

use std::sync::Arc;

use async_trait::async_trait;

use countbot_memory::{MatchMode, MemoryStore};

use super::{Tool, ToolResult};

pub struct MemoryAppendTool {
    memory: Arc<MemoryStore>,
    /// Recorded as the line's source column (e.g. the channel name).
    source: String,
}

impl MemoryAppendTool {
    pub fn new(memory: Arc<MemoryStore>, source: impl Into<String>) -> Self {
        Self {
            memory,
            source: source.into(),
        }
    }
}

#[async_trait]
impl Tool for MemoryAppendTool {
    fn name(&self) -> &str {
        "memory_append"
    }

    fn description(&self) -> &str {
        "Save a fact to long-term memory. Separate multiple facts with '；'."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The fact(s) to remember."
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let Some(content) = input.get("content").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: content");
        };
        match self.memory.append(&self.source, content) {
            Ok(line) => ToolResult::success(format!("已记住（第 {line} 行）")),
            Err(e) => ToolResult::error(format!("failed to append memory: {e}")),
        }
    }
}

pub struct MemoryReadTool {
    memory: Arc<MemoryStore>,
}

impl MemoryReadTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryReadTool {
    fn name(&self) -> &str {
        "memory_read"
    }

    fn description(&self) -> &str {
        "Read memory lines by 1-based line number. Omit `end` to read one line; \
         omit both to read the most recent entries."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "start": {
                    "type": "integer",
                    "description": "First line to read (1-based)."
                },
                "end": {
                    "type": "integer",
                    "description": "Last line to read, inclusive (optional)."
                }
            }
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let start = input.get("start").and_then(|v| v.as_u64()).map(|v| v as usize);
        let end = input.get("end").and_then(|v| v.as_u64()).map(|v| v as usize);

        let result = match start {
            Some(start) => self.memory.read_lines(start, end),
            None => self.memory.get_recent(10),
        };
        match result {
            Ok(text) => ToolResult::success(text),
            Err(e) => ToolResult::error(format!("failed to read memory: {e}")),
        }
    }
}

pub struct MemorySearchTool {
    memory: Arc<MemoryStore>,
}

impl MemorySearchTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search memory by keywords. `mode` is 'or' (default, any keyword) or \
         'and' (all keywords)."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "keywords": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Keywords to look for."
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum matches to return (default 15)."
                },
                "mode": {
                    "type": "string",
                    "enum": ["or", "and"],
                    "description": "Match logic."
                }
            },
            "required": ["keywords"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let keywords: Vec<String> = input
            .get("keywords")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let max_results = input
            .get("max_results")
            .and_then(|v| v.as_u64())
            .unwrap_or(15) as usize;
        let mode = match input.get("mode").and_then(|v| v.as_str()) {
            Some("and") => MatchMode::And,
            _ => MatchMode::Or,
        };

        match self.memory.search(&keywords, max_results, mode) {
            Ok(text) => ToolResult::success(text),
            Err(e) => ToolResult::error(format!("failed to search memory: {e}")),
        }
    }
}

pub struct MemoryDeleteTool {
    memory: Arc<MemoryStore>,
}

impl MemoryDeleteTool {
    pub fn new(memory: Arc<MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryDeleteTool {
    fn name(&self) -> &str {
        "memory_delete"
    }

    fn description(&self) -> &str {
        "Delete memory lines by 1-based line number. Remaining lines are \
         renumbered."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "line_numbers": {
                    "type": "array",
                    "items": {"type": "integer"},
                    "description": "Line numbers to delete."
                }
            },
            "required": ["line_numbers"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let lines: Vec<usize> = input
            .get("line_numbers")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_u64().map(|n| n as usize))
                    .collect()
            })
            .unwrap_or_default();
        if lines.is_empty() {
            return ToolResult::error("line_numbers must be a non-empty array of integers");
        }

        match self.memory.delete_lines(&lines) {
            Ok(deleted) => ToolResult::success(format!("已删除 {deleted} 条记忆")),
            Err(e) => ToolResult::error(format!("failed to delete memory: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory() -> (TempDir, Arc<MemoryStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn append_then_read_round_trip() {
        let (_dir, store) = memory();
        let append = MemoryAppendTool::new(store.clone(), "web-chat");
        let read = MemoryReadTool::new(store);

        let result = append
            .execute(serde_json::json!({"content": "likes green tea"}), None)
            .await;
        assert!(result.content.contains("第 1 行"));

        let result = read.execute(serde_json::json!({"start": 1}), None).await;
        assert!(result.content.contains("likes green tea"));
        assert!(result.content.contains("web-chat"));
    }

    #[tokio::test]
    async fn search_tool_passes_mode_through() {
        let (_dir, store) = memory();
        store.append("a", "apple pie").unwrap();
        store.append("a", "apple tart").unwrap();
        let search = MemorySearchTool::new(store);
        let result = search
            .execute(
                serde_json::json!({"keywords": ["apple", "pie"], "mode": "and"}),
                None,
            )
            .await;
        assert!(result.content.contains("[1]"));
        assert!(!result.content.contains("[2]"));
    }

    #[tokio::test]
    async fn delete_tool_requires_line_numbers() {
        let (_dir, store) = memory();
        let delete = MemoryDeleteTool::new(store);
        let result = delete.execute(serde_json::json!({}), None).await;
        assert!(result.is_error);
    }
}
