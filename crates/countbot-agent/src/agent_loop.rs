//! The agentic turn loop.
//!
//! One call to [`AgentLoop::process_message`] drives up to `max_iterations`
//! LLM rounds. Assistant text streams out to the caller as it is produced;
//! tool calls are executed between rounds and their results injected back as
//! `tool` role messages. Cancellation is polled between chunks and between
//! iterations.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::prompt::ContextBuilder;
use crate::provider::{text_message, ChatRequest, LlmProvider, StreamChunk, ToolCall};
use crate::tools::ToolRegistry;

/// Marker streamed to the caller when a turn is cancelled mid-flight.
pub const STOPPED_MARKER: &str = "[stopped]";

/// Events surfaced during a turn. Everything user-visible arrives as `Text`
/// (including friendly error sentences and the stopped marker); tool events
/// let richer frontends render call progress.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Text(String),
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        result: String,
        duration_ms: u64,
    },
}

/// Mutable call parameters, hot-reloadable from the settings API.
#[derive(Debug, Clone)]
pub struct LoopParams {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub max_iterations: u32,
}

pub struct AgentLoop {
    provider: RwLock<Arc<dyn LlmProvider>>,
    tools: ToolRegistry,
    context: Arc<ContextBuilder>,
    params: RwLock<LoopParams>,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        context: Arc<ContextBuilder>,
        params: LoopParams,
    ) -> Self {
        Self {
            provider: RwLock::new(provider),
            tools,
            context,
            params: RwLock::new(params),
        }
    }

    /// Swap the provider after a settings change.
    pub fn set_provider(&self, provider: Arc<dyn LlmProvider>) {
        *self.provider.write().unwrap() = provider;
    }

    /// Handle on the current provider (callers making one-off LLM calls).
    pub fn provider(&self) -> Arc<dyn LlmProvider> {
        Arc::clone(&*self.provider.read().unwrap())
    }

    pub fn context(&self) -> &Arc<ContextBuilder> {
        &self.context
    }

    /// Hot-reload call parameters after a settings change.
    pub fn update_params(&self, params: LoopParams) {
        info!(model = %params.model, "agent loop params reloaded");
        *self.params.write().unwrap() = params;
    }

    pub fn params(&self) -> LoopParams {
        self.params.read().unwrap().clone()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run one user turn. The returned stream yields assistant text chunks;
    /// it ends when the turn completes, errors out, or is cancelled.
    pub fn process_message(
        self: &Arc<Self>,
        text: String,
        session_id: String,
        history: Vec<serde_json::Value>,
        media: Vec<String>,
        cancel: CancellationToken,
    ) -> ReceiverStream<String> {
        let mut events = self.process_events(text, session_id, history, media, cancel);
        let (tx, rx) = mpsc::channel::<String>(64);

        tokio::spawn(async move {
            use tokio_stream::StreamExt;
            while let Some(event) = events.next().await {
                if let AgentEvent::Text(piece) = event {
                    if tx.send(piece).await.is_err() {
                        break;
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Like [`AgentLoop::process_message`] but with tool-call events
    /// interleaved, for frontends that render call progress.
    pub fn process_events(
        self: &Arc<Self>,
        text: String,
        session_id: String,
        history: Vec<serde_json::Value>,
        media: Vec<String>,
        cancel: CancellationToken,
    ) -> ReceiverStream<AgentEvent> {
        let (tx, rx) = mpsc::channel::<AgentEvent>(64);
        let this = Arc::clone(self);

        tokio::spawn(async move {
            this.run_turn(text, session_id, history, media, cancel, tx)
                .await;
        });

        ReceiverStream::new(rx)
    }

    async fn run_turn(
        &self,
        text: String,
        session_id: String,
        history: Vec<serde_json::Value>,
        media: Vec<String>,
        cancel: CancellationToken,
        tx: mpsc::Sender<AgentEvent>,
    ) {
        let params = self.params();
        let system_prompt = self.context.build_system_prompt();

        // Media arrives as structured placeholders appended to the user turn
        // so the model knows files exist even though it cannot open them.
        let user_content = if media.is_empty() {
            text.clone()
        } else {
            let refs: Vec<String> = media.iter().map(|m| format!("[附件: {m}]")).collect();
            format!("{}\n{}", text, refs.join("\n"))
        };

        let mut messages: Vec<serde_json::Value> = Vec::with_capacity(history.len() + 2);
        messages.push(text_message("system", &system_prompt));
        messages.extend(history);
        messages.push(text_message("user", &user_content));

        let tool_defs = self.tools.definitions();

        for iteration in 0..params.max_iterations {
            if cancel.is_cancelled() {
                let _ = tx.send(AgentEvent::Text(STOPPED_MARKER.to_string())).await;
                return;
            }

            debug!(iteration, session = %session_id, "agent loop iteration");

            let request = ChatRequest {
                model: params.model.clone(),
                messages: messages.clone(),
                tools: tool_defs.clone(),
                max_tokens: params.max_tokens,
                temperature: params.temperature,
            };

            let provider = Arc::clone(&*self.provider.read().unwrap());
            let mut chunk_rx = provider.chat_stream(request).await;

            let mut content_buf = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(AgentEvent::Text(STOPPED_MARKER.to_string())).await;
                        return;
                    }
                    chunk = chunk_rx.recv() => chunk,
                };

                let Some(chunk) = chunk else {
                    break;
                };
                match chunk {
                    StreamChunk::Content(piece) => {
                        content_buf.push_str(&piece);
                        if tx.send(AgentEvent::Text(piece)).await.is_err() {
                            return; // caller went away
                        }
                    }
                    StreamChunk::Reasoning(_) => {}
                    StreamChunk::ToolCall(call) => tool_calls.push(call),
                    StreamChunk::Finish { reason, .. } => {
                        debug!(%reason, "stream finished");
                        break;
                    }
                    StreamChunk::Error(message) => {
                        warn!(%message, session = %session_id, "provider error chunk");
                        let _ = tx.send(AgentEvent::Text(message)).await;
                        return;
                    }
                }
            }

            if tool_calls.is_empty() {
                // No tools requested: the turn is complete.
                return;
            }

            // Assistant message carrying the buffered text plus the calls,
            // followed by one tool message per call, in call order.
            messages.push(assistant_with_tool_calls(&content_buf, &tool_calls));

            for call in &tool_calls {
                if cancel.is_cancelled() {
                    let _ = tx.send(AgentEvent::Text(STOPPED_MARKER.to_string())).await;
                    return;
                }
                let _ = tx
                    .send(AgentEvent::ToolCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .await;

                let started = std::time::Instant::now();
                let result = self
                    .tools
                    .execute(&call.name, call.arguments.clone(), Some(&session_id))
                    .await;
                let _ = tx
                    .send(AgentEvent::ToolResult {
                        name: call.name.clone(),
                        result: result.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;

                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "name": call.name,
                    "content": result,
                }));
            }
        }

        warn!(
            max_iterations = params.max_iterations,
            session = %session_id,
            "agent loop hit the iteration cap"
        );
    }
}

/// Build the assistant message that carries structured tool calls.
fn assistant_with_tool_calls(content: &str, calls: &[ToolCall]) -> serde_json::Value {
    let wire_calls: Vec<serde_json::Value> = calls
        .iter()
        .map(|c| {
            serde_json::json!({
                "id": c.id,
                "type": "function",
                "function": {
                    "name": c.name,
                    "arguments": c.arguments.to_string(),
                }
            })
        })
        .collect();

    serde_json::json!({
        "role": "assistant",
        "content": if content.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(content.to_string())
        },
        "tool_calls": wire_calls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolResult};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_stream::StreamExt;

    /// Scripted provider: pops one canned chunk list per call.
    struct ScriptedProvider {
        scripts: Mutex<Vec<Vec<StreamChunk>>>,
        seen_requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Vec<StreamChunk>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                seen_requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn chat_stream(&self, req: ChatRequest) -> mpsc::Receiver<StreamChunk> {
            self.seen_requests.lock().unwrap().push(req);
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() {
                    vec![StreamChunk::Finish {
                        reason: "stop".into(),
                        usage: None,
                    }]
                } else {
                    scripts.remove(0)
                }
            };
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for chunk in script {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });
            rx
        }
    }

    struct StaticFileTool;

    #[async_trait]
    impl Tool for StaticFileTool {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "read"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _input: serde_json::Value, _s: Option<&str>) -> ToolResult {
            ToolResult::success("hi")
        }
    }

    fn test_loop(provider: Arc<dyn LlmProvider>, tools: ToolRegistry) -> Arc<AgentLoop> {
        let dir = tempfile::TempDir::new().unwrap();
        let memory =
            Arc::new(countbot_memory::MemoryStore::new(&dir.path().join("memory")).unwrap());
        let context = Arc::new(ContextBuilder::new(
            countbot_core::config::PersonaConfig::default(),
            memory,
            dir.path().to_path_buf(),
        ));
        // Leak the tempdir so prompt building keeps working for the test body.
        std::mem::forget(dir);
        Arc::new(AgentLoop::new(
            provider,
            tools,
            context,
            LoopParams {
                model: "test-model".into(),
                temperature: 0.7,
                max_tokens: 256,
                max_iterations: 10,
            },
        ))
    }

    async fn collect(stream: ReceiverStream<String>) -> String {
        stream.collect::<Vec<String>>().await.join("")
    }

    #[tokio::test]
    async fn echo_turn_streams_content() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            StreamChunk::Content("pong".into()),
            StreamChunk::Finish {
                reason: "stop".into(),
                usage: None,
            },
        ]]));
        let agent = test_loop(provider, ToolRegistry::new());
        let out = collect(agent.process_message(
            "ping".into(),
            "s1".into(),
            vec![],
            vec![],
            CancellationToken::new(),
        ))
        .await;
        assert_eq!(out, "pong");
    }

    #[tokio::test]
    async fn tool_call_turn_injects_result_and_continues() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![
                StreamChunk::ToolCall(ToolCall {
                    id: "c1".into(),
                    name: "read_file".into(),
                    arguments: serde_json::json!({"path": "readme.txt"}),
                }),
                StreamChunk::Finish {
                    reason: "tool_calls".into(),
                    usage: None,
                },
            ],
            vec![
                StreamChunk::Content("file says hi".into()),
                StreamChunk::Finish {
                    reason: "stop".into(),
                    usage: None,
                },
            ],
        ]));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(StaticFileTool));
        let agent = test_loop(provider.clone(), tools);

        let out = collect(agent.process_message(
            "what does the readme say?".into(),
            "s1".into(),
            vec![],
            vec![],
            CancellationToken::new(),
        ))
        .await;
        assert_eq!(out, "file says hi");

        // Second request must carry assistant(tool_calls) then tool("hi").
        let requests = provider.seen_requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let second = &requests[1].messages;
        let assistant = &second[second.len() - 2];
        assert_eq!(assistant["role"], "assistant");
        assert_eq!(assistant["tool_calls"][0]["id"], "c1");
        let tool_msg = &second[second.len() - 1];
        assert_eq!(tool_msg["role"], "tool");
        assert_eq!(tool_msg["tool_call_id"], "c1");
        assert_eq!(tool_msg["name"], "read_file");
        assert_eq!(tool_msg["content"], "hi");
    }

    #[tokio::test]
    async fn tool_failure_becomes_error_text_not_abort() {
        struct FailingTool;
        #[async_trait]
        impl Tool for FailingTool {
            fn name(&self) -> &str {
                "broken"
            }
            fn description(&self) -> &str {
                "fails"
            }
            fn input_schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(&self, _i: serde_json::Value, _s: Option<&str>) -> ToolResult {
                ToolResult::error("exploded")
            }
        }

        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![
                StreamChunk::ToolCall(ToolCall {
                    id: "c1".into(),
                    name: "broken".into(),
                    arguments: serde_json::json!({}),
                }),
                StreamChunk::Finish {
                    reason: "tool_calls".into(),
                    usage: None,
                },
            ],
            vec![
                StreamChunk::Content("recovered".into()),
                StreamChunk::Finish {
                    reason: "stop".into(),
                    usage: None,
                },
            ],
        ]));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(FailingTool));
        let agent = test_loop(provider.clone(), tools);

        let out = collect(agent.process_message(
            "go".into(),
            "s1".into(),
            vec![],
            vec![],
            CancellationToken::new(),
        ))
        .await;
        assert_eq!(out, "recovered");

        let requests = provider.seen_requests.lock().unwrap();
        let tool_msg = requests[1].messages.last().unwrap();
        assert!(tool_msg["content"]
            .as_str()
            .unwrap()
            .starts_with("Error: exploded"));
    }

    #[tokio::test]
    async fn provider_error_chunk_ends_the_turn_with_friendly_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![StreamChunk::Error(
            "API 密钥无效或已过期，请在设置中检查并更新密钥。".into(),
        )]]));
        let agent = test_loop(provider, ToolRegistry::new());
        let out = collect(agent.process_message(
            "hi".into(),
            "s1".into(),
            vec![],
            vec![],
            CancellationToken::new(),
        ))
        .await;
        assert!(out.contains("密钥"));
    }

    #[tokio::test]
    async fn cancellation_yields_stopped_marker() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            StreamChunk::Content("should not appear".into()),
            StreamChunk::Finish {
                reason: "stop".into(),
                usage: None,
            },
        ]]));
        let agent = test_loop(provider, ToolRegistry::new());
        let out = collect(agent.process_message(
            "hi".into(),
            "s1".into(),
            vec![],
            vec![],
            cancel,
        ))
        .await;
        assert_eq!(out, STOPPED_MARKER);
    }

    #[tokio::test]
    async fn media_refs_are_appended_to_the_user_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![StreamChunk::Finish {
            reason: "stop".into(),
            usage: None,
        }]]));
        let agent = test_loop(provider.clone(), ToolRegistry::new());
        let _ = collect(agent.process_message(
            "look at this".into(),
            "s1".into(),
            vec![],
            vec!["/tmp/photo.jpg".into()],
            CancellationToken::new(),
        ))
        .await;
        let requests = provider.seen_requests.lock().unwrap();
        let user = requests[0].messages.last().unwrap();
        assert!(user["content"].as_str().unwrap().contains("photo.jpg"));
    }
}
