//! Tool system for the agent loop.
//!
//! Defines the `Tool` trait all tools implement, plus a registry that
//! advertises JSON-schema definitions to the LLM and dispatches calls by
//! name. Execution failures are folded into `Error: …` text — a broken tool
//! must never abort the turn.

pub mod edit_file;
pub mod exec_shell;
pub mod list_dir;
pub mod memory_tools;
pub mod read_file;
pub mod send_media;
pub mod subagent_tool;
pub mod web;
pub mod workspace;
pub mod write_file;

use std::sync::Arc;

use async_trait::async_trait;

use crate::provider::ToolDefinition;

/// Result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Text content returned to the LLM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait that all tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. "read_file").
    fn name(&self) -> &str;
    /// Human-readable description shown to the LLM.
    fn description(&self) -> &str;
    /// JSON Schema for the input parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute with the given input. `session_id` identifies the calling
    /// conversation when one exists (cron and subagent turns pass their own).
    async fn execute(&self, input: serde_json::Value, session_id: Option<&str>) -> ToolResult;
}

/// Named tool collection handed to the agent loop.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions passed to the LLM alongside the messages.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// A copy of this registry with the named tools removed. Used to build
    /// the restricted subagent registry (no spawn_subagent, no send_media).
    pub fn without(&self, names: &[&str]) -> Self {
        Self {
            tools: self
                .tools
                .iter()
                .filter(|t| !names.contains(&t.name()))
                .cloned()
                .collect(),
        }
    }

    /// Dispatch a call by name. Always returns text for the tool-role
    /// message; failures come back as `Error: …` instead of propagating.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        session_id: Option<&str>,
    ) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            return format!("Error: unknown tool: {name}");
        };
        tracing::debug!(tool = name, "executing tool");
        let result = tool.execute(input, session_id).await;
        if result.is_error {
            format!("Error: {}", result.content)
        } else {
            result.content
        }
    }
}
