//! WebSocket chat endpoint.
//!
//! Client → server: `message {session_id, content, media?}`, `ping`,
//! `subscribe {session_id}`, `unsubscribe`.
//! Server → client: `connected`, `pong`, `message_chunk`, `tool_call`,
//! `tool_result`, `message_complete`, `error`.
//!
//! The message path mirrors the channel handler: overflow summarization,
//! user-turn persistence, streamed agent events, assistant persistence.

use std::sync::Arc;

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use countbot_agent::agent_loop::{AgentEvent, STOPPED_MARKER};

use crate::app::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<serde_json::Value>(64);

    let _ = out_tx.send(serde_json::json!({ "type": "connected" })).await;
    info!("websocket client connected");

    // Single writer task so turn tasks can emit frames concurrently.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink
                .send(WsFrame::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // Forward subagent lifecycle frames (task_created / task_status / …).
    let task_forwarder = {
        let mut task_events = state.subagents.subscribe();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Ok(frame) = task_events.recv().await {
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
        })
    };

    while let Some(Ok(frame)) = stream.next().await {
        let WsFrame::Text(text) = frame else { continue };
        let Ok(request) = serde_json::from_str::<serde_json::Value>(&text) else {
            let _ = out_tx
                .send(serde_json::json!({
                    "type": "error",
                    "message": "无法解析消息",
                    "code": "INVALID_INPUT",
                }))
                .await;
            continue;
        };

        match request.get("type").and_then(|v| v.as_str()) {
            Some("ping") => {
                let _ = out_tx.send(serde_json::json!({ "type": "pong" })).await;
            }
            Some("subscribe") | Some("unsubscribe") => {
                // Single-conversation clients: acknowledged, nothing to do.
                debug!("subscription frame acknowledged");
            }
            Some("tool_execute") => {
                let tool = request
                    .get("tool")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let arguments = request
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                let session_id = request
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .map(String::from);

                let state = Arc::clone(&state);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let started = std::time::Instant::now();
                    let result = state
                        .agent
                        .tools()
                        .execute(&tool, arguments, session_id.as_deref())
                        .await;
                    let _ = out_tx
                        .send(serde_json::json!({
                            "type": "tool_result",
                            "tool": tool,
                            "result": result,
                            "duration": started.elapsed().as_millis() as u64,
                        }))
                        .await;
                });
            }
            Some("message") => {
                let session_id = request
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let content = request
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                if content.is_empty() {
                    let _ = out_tx
                        .send(serde_json::json!({
                            "type": "error",
                            "message": "消息内容不能为空",
                            "code": "INVALID_INPUT",
                        }))
                        .await;
                    continue;
                }
                let media: Vec<String> = request
                    .get("media")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default();

                let state = Arc::clone(&state);
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    run_ws_turn(state, out_tx, session_id, content, media).await;
                });
            }
            other => {
                warn!(frame_type = ?other, "unknown websocket frame type");
                let _ = out_tx
                    .send(serde_json::json!({
                        "type": "error",
                        "message": "未知的消息类型",
                        "code": "INVALID_INPUT",
                    }))
                    .await;
            }
        }
    }

    task_forwarder.abort();
    writer.abort();
    info!("websocket client disconnected");
}

async fn run_ws_turn(
    state: Arc<AppState>,
    out_tx: mpsc::Sender<serde_json::Value>,
    session_id: String,
    content: String,
    media: Vec<String>,
) {
    let send_error = |message: String| {
        let out_tx = out_tx.clone();
        async move {
            let _ = out_tx
                .send(serde_json::json!({
                    "type": "error",
                    "message": message,
                    "code": "INTERNAL_ERROR",
                }))
                .await;
        }
    };

    if let Err(e) = state
        .sessions
        .ensure_session(&session_id, &format!("web-chat:{session_id}"))
    {
        send_error(format!("会话创建失败: {e}")).await;
        return;
    }

    // Share the per-session lock and cancel slot with channel traffic.
    let lock = state.handler.session_lock(&session_id);
    let _turn_guard = lock.lock().await;
    let cancel = state.handler.register_cancel(&session_id);

    let max_history = {
        let config = state.config.read().unwrap();
        config.persona.max_history_messages
    };

    if max_history > 0 {
        let provider = state.agent.provider();
        let model = state.agent.params().model;
        if let Err(e) = state
            .sessions
            .summarize_overflow(
                &session_id,
                max_history as usize,
                provider.as_ref(),
                &model,
                &state.memory,
            )
            .await
        {
            warn!(session = %session_id, "overflow summarization failed: {e}");
        }
    }

    if let Err(e) = state.sessions.add_message(&session_id, "user", &content) {
        state.handler.unregister_cancel(&session_id);
        send_error(format!("消息保存失败: {e}")).await;
        return;
    }

    let limit = if max_history < 0 {
        None
    } else {
        Some(max_history as usize)
    };
    let mut history: Vec<serde_json::Value> = state
        .sessions
        .get_messages(&session_id, limit, 0)
        .unwrap_or_default()
        .iter()
        .map(|m| m.to_context_value())
        .collect();
    history.pop();

    let message_id = Uuid::new_v4().to_string();
    let mut events = state.agent.process_events(
        content,
        session_id.clone(),
        history,
        media,
        cancel.clone(),
    );

    let mut parts = String::new();
    while let Some(event) = events.next().await {
        match event {
            AgentEvent::Text(piece) => {
                parts.push_str(&piece);
                let _ = out_tx
                    .send(serde_json::json!({
                        "type": "message_chunk",
                        "content": piece,
                    }))
                    .await;
            }
            AgentEvent::ToolCall { name, arguments } => {
                let _ = out_tx
                    .send(serde_json::json!({
                        "type": "tool_call",
                        "tool": name,
                        "arguments": arguments,
                        "message_id": message_id,
                    }))
                    .await;
            }
            AgentEvent::ToolResult {
                name,
                result,
                duration_ms,
            } => {
                let _ = out_tx
                    .send(serde_json::json!({
                        "type": "tool_result",
                        "tool": name,
                        "result": result,
                        "message_id": message_id,
                        "duration": duration_ms,
                    }))
                    .await;
            }
        }
    }

    state.handler.unregister_cancel(&session_id);

    let response = parts.trim().to_string();
    if !cancel.is_cancelled() && response != STOPPED_MARKER && !response.is_empty() {
        if let Err(e) = state.sessions.add_message(&session_id, "assistant", &response) {
            warn!(session = %session_id, "failed to save assistant turn: {e}");
        }
    }

    let _ = out_tx
        .send(serde_json::json!({
            "type": "message_complete",
            "message_id": message_id,
        }))
        .await;
}
