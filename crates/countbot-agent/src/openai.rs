//! OpenAI-compatible streaming chat client.
//!
//! Speaks the `/v1/chat/completions` SSE protocol. Content deltas are
//! forwarded as they arrive; fragmented tool-call deltas are assembled by
//! index and flushed when the finish signal arrives. Transport and API
//! failures surface as a single user-friendly `Error` chunk.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{ChatRequest, LlmProvider, StreamChunk, Usage};
use crate::registry;
use crate::stream::{parse_sse_data, ToolCallAccumulator, WireChunk};

/// Default request timeout (seconds) for LLM calls.
const REQUEST_TIMEOUT_SECS: u64 = 120;

pub struct OpenAiClient {
    client: reqwest::Client,
    provider_id: String,
    api_key: String,
    base_url: String,
    chat_path: String,
}

impl OpenAiClient {
    /// Create a client for a provider id from the registry, with an optional
    /// base URL override for self-hosted endpoints.
    pub fn new(provider_id: &str, api_key: String, base_url: Option<String>) -> Self {
        let known = registry::lookup(provider_id);
        let base_url = base_url
            .or_else(|| known.map(|p| p.base_url.to_string()))
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        let chat_path = known
            .map(|p| p.chat_path.to_string())
            .unwrap_or_else(|| "/v1/chat/completions".to_string());

        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            provider_id: provider_id.to_string(),
            api_key,
            base_url,
            chat_path,
        }
    }

    fn build_body(&self, req: &ChatRequest) -> serde_json::Value {
        // Some providers route by a model prefix (openrouter/<id> style).
        let model = registry::apply_model_prefix(&self.provider_id, &req.model);

        let mut body = serde_json::json!({
            "model": model,
            "messages": req.messages,
            "temperature": req.temperature,
            "stream": true,
        });
        if req.max_tokens > 0 {
            body["max_tokens"] = serde_json::json!(req.max_tokens);
        }
        if !req.tools.is_empty() {
            let tools: Vec<serde_json::Value> = req.tools.iter().map(|t| t.to_wire()).collect();
            body["tools"] = serde_json::json!(tools);
            body["tool_choice"] = serde_json::json!("auto");
        }
        if let Some(overrides) = registry::model_overrides(&self.provider_id, &req.model) {
            for (k, v) in overrides {
                body[k] = v.clone();
            }
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiClient {
    fn name(&self) -> &str {
        &self.provider_id
    }

    async fn chat_stream(&self, req: ChatRequest) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(64);

        let body = self.build_body(&req);
        let url = format!("{}{}", self.base_url, self.chat_path);
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let model = req.model.clone();

        tokio::spawn(async move {
            debug!(%model, %url, "starting streaming chat request");

            let resp = client
                .post(&url)
                .bearer_auth(&api_key)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await;

            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx
                        .send(StreamChunk::Error(format_error_message(&e.to_string())))
                        .await;
                    return;
                }
            };

            let status = resp.status().as_u16();
            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_default();
                warn!(status, body = %text, "chat API error");
                let _ = tx
                    .send(StreamChunk::Error(format_error_message(&format!(
                        "{status} {text}"
                    ))))
                    .await;
                return;
            }

            process_stream(resp, tx).await;
        });

        rx
    }
}

/// Read the SSE byte stream and emit chunks until `[DONE]` or a finish signal.
async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamChunk>) {
    let mut accumulator = ToolCallAccumulator::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<Usage> = None;
    let mut line_buf = String::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamChunk::Error(format_error_message(&e.to_string())))
                    .await;
                return;
            }
        };

        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };

        line_buf.push_str(text);
        // Hold back the final partial line until the next chunk completes it.
        let lines: Vec<String> = line_buf.split('\n').map(String::from).collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().cloned().unwrap_or_default();

        for line in complete {
            let line = line.trim();
            let Some(data) = parse_sse_data(line) else {
                continue;
            };
            if data.trim() == "[DONE]" {
                break 'outer;
            }

            let Ok(wire) = serde_json::from_str::<WireChunk>(data) else {
                continue;
            };

            if let Some(u) = &wire.usage {
                usage = Some(Usage {
                    prompt_tokens: u.prompt_tokens,
                    completion_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                });
            }

            for choice in &wire.choices {
                if let Some(content) = &choice.delta.content {
                    if !content.is_empty()
                        && tx.send(StreamChunk::Content(content.clone())).await.is_err()
                    {
                        return; // receiver dropped
                    }
                }
                if let Some(reasoning) = &choice.delta.reasoning_content {
                    if !reasoning.is_empty() {
                        let _ = tx.send(StreamChunk::Reasoning(reasoning.clone())).await;
                    }
                }
                for delta in &choice.delta.tool_calls {
                    accumulator.push(delta);
                }
                if let Some(reason) = &choice.finish_reason {
                    if !reason.is_empty() {
                        finish_reason = Some(reason.clone());
                    }
                }
            }

            if finish_reason.is_some() {
                break 'outer;
            }
        }

        line_buf = remainder;
    }

    for call in accumulator.finalize() {
        let _ = tx.send(StreamChunk::ToolCall(call)).await;
    }

    let _ = tx
        .send(StreamChunk::Finish {
            reason: finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage,
        })
        .await;
}

/// Map a raw provider error onto the fixed user-facing vocabulary.
pub fn format_error_message(raw: &str) -> String {
    let lower = raw.to_lowercase();

    if ["429", "余额不足", "quota", "rate limit", "insufficient balance", "资源包", "balance"]
        .iter()
        .any(|k| lower.contains(k) || raw.contains(k))
    {
        if raw.contains("余额") || raw.contains("资源包") || raw.contains("充值") || lower.contains("balance") {
            return "API 账户余额不足，请前往服务商控制台充值后重试。".to_string();
        }
        return "请求过于频繁或 API 配额已用尽，请稍后重试或检查账户额度。".to_string();
    }

    if ["401", "unauthorized", "authentication", "invalid token", "api key"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return "API 密钥无效或已过期，请在设置中检查并更新密钥。".to_string();
    }

    if ["404", "model not found", "model_not_found", "does not exist"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return "所选模型不可用，请在设置中确认模型名称是否正确。".to_string();
    }

    if ["context length", "context_length_exceeded", "too long", "maximum context"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return "对话上下文过长，请尝试新建会话或清除历史消息。".to_string();
    }

    if ["500", "502", "503", "504", "internal server error", "service unavailable"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return "AI 服务暂时不可用，请稍后重试。".to_string();
    }

    if ["timeout", "timed out", "connection", "network", "ssl", "dns"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return "网络连接异常，请检查网络设置后重试。".to_string();
    }

    let excerpt: String = raw.chars().take(200).collect();
    format!("AI 调用出错: {excerpt}")
}
