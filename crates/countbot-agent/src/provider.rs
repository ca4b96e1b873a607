use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Tool definition sent alongside the messages (OpenAI function format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the parameters.
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    /// Render as the `{"type": "function", "function": {...}}` wire shape.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}

/// A complete tool call assembled from streaming deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments. An empty delta string becomes `{}`; unparseable
    /// deltas become `{"raw": "<fragments>"}` so the loop can still log them.
    pub arguments: serde_json::Value,
}

/// Token accounting reported on the final chunk, when the provider sends it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One event in a streaming chat completion.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Incremental assistant text.
    Content(String),
    /// Incremental reasoning content (DeepSeek-R1 style thinking models).
    Reasoning(String),
    /// A fully assembled tool call, emitted at finish time.
    ToolCall(ToolCall),
    /// End of stream.
    Finish {
        reason: String,
        usage: Option<Usage>,
    },
    /// Transport or API failure, already mapped to a user-friendly sentence.
    Error(String),
}

/// Request to a chat-completion provider.
///
/// `messages` are raw OpenAI-format JSON objects so the agent loop can carry
/// structured `tool_calls` / `tool` role entries without an intermediate type.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<ToolDefinition>,
    /// 0 omits the parameter and lets the model decide.
    pub max_tokens: u32,
    pub temperature: f64,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<serde_json::Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Streaming chat-completion client interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Start a streaming completion. The receiver yields chunks until a
    /// `Finish` or `Error` chunk, after which the stream closes.
    async fn chat_stream(&self, req: ChatRequest) -> mpsc::Receiver<StreamChunk>;
}

/// Drive a stream to completion and return the concatenated text content.
///
/// Used by the overflow summarizer and the heartbeat service, which need a
/// plain non-streaming answer. An `Error` chunk becomes an `Err`.
pub async fn chat_collect(
    provider: &dyn LlmProvider,
    req: ChatRequest,
) -> crate::error::Result<String> {
    let mut rx = provider.chat_stream(req).await;
    let mut parts = String::new();
    while let Some(chunk) = rx.recv().await {
        match chunk {
            StreamChunk::Content(text) => parts.push_str(&text),
            StreamChunk::Error(msg) => return Err(crate::error::AgentError::Provider(msg)),
            StreamChunk::Finish { .. } => break,
            StreamChunk::Reasoning(_) | StreamChunk::ToolCall(_) => {}
        }
    }
    Ok(parts.trim().to_string())
}

/// Build a plain-text message object.
pub fn text_message(role: &str, content: &str) -> serde_json::Value {
    serde_json::json!({ "role": role, "content": content })
}
