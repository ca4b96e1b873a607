//! Feishu (Lark) adapter.
//!
//! The WebSocket client is non-reentrant with the host runtime's main loop,
//! so it runs in a dedicated worker task that forwards normalized events to
//! the adapter over a bounded queue (capacity 1000). The adapter side drains
//! that queue with a 1-second poll so shutdown is prompt.
//!
//! Outbound supports plain text and a markdown card; pipe tables inside the
//! message are lifted into card table elements, the rest stays markdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use countbot_core::config::FeishuConfig;
use countbot_core::types::{InboundMessage, OutboundMessage};

use crate::channel::{sender_allowed, Channel, InboundCallback, TestConnectionResult};
use crate::dedup::SeenMessages;
use crate::error::{ChannelError, Result};

const TOKEN_URL: &str = "https://open.feishu.cn/open-apis/auth/v3/tenant_access_token/internal";
const WS_ENDPOINT_URL: &str = "https://open.feishu.cn/callback/ws/endpoint";
const SEND_URL: &str = "https://open.feishu.cn/open-apis/im/v1/messages";
/// Worker → adapter queue bound.
const WORKER_QUEUE_CAPACITY: usize = 1000;
/// Adapter-side queue poll interval.
const QUEUE_READ_TIMEOUT: Duration = Duration::from_secs(1);
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

struct TokenCache {
    token: String,
    expires_at: Instant,
}

pub struct FeishuAdapter {
    config: FeishuConfig,
    client: reqwest::Client,
    callback: Mutex<Option<InboundCallback>>,
    seen: Arc<SeenMessages>,
    token: tokio::sync::Mutex<Option<TokenCache>>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl FeishuAdapter {
    pub fn new(config: &FeishuConfig) -> Result<Self> {
        if config.app_id.is_empty() || config.app_secret.is_empty() {
            return Err(ChannelError::NotConfigured("feishu app_id/secret".into()));
        }
        Ok(Self {
            config: config.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            callback: Mutex::new(None),
            seen: Arc::new(SeenMessages::default()),
            token: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    async fn tenant_token(&self) -> Result<String> {
        let mut cache = self.token.lock().await;
        if let Some(ref cached) = *cache {
            if cached.expires_at > Instant::now() + Duration::from_secs(TOKEN_REFRESH_MARGIN_SECS)
            {
                return Ok(cached.token.clone());
            }
        }

        let resp: serde_json::Value = self
            .client
            .post(TOKEN_URL)
            .json(&serde_json::json!({
                "app_id": self.config.app_id,
                "app_secret": self.config.app_secret,
            }))
            .send()
            .await?
            .json()
            .await?;

        let token = resp
            .get("tenant_access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::Auth(format!("feishu token response: {resp}")))?
            .to_string();
        let expire = resp.get("expire").and_then(|v| v.as_u64()).unwrap_or(7200);

        *cache = Some(TokenCache {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expire),
        });
        Ok(token)
    }
}

/// Worker side: owns the WebSocket, pushes normalized inbound messages into
/// the bounded queue. Runs until the socket closes or the token cancels.
async fn ws_worker(
    client: reqwest::Client,
    app_id: String,
    app_secret: String,
    seen: Arc<SeenMessages>,
    tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) -> Result<()> {
    let resp: serde_json::Value = client
        .post(WS_ENDPOINT_URL)
        .json(&serde_json::json!({ "AppID": app_id, "AppSecret": app_secret }))
        .send()
        .await?
        .json()
        .await?;
    let url = resp
        .pointer("/data/URL")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ChannelError::Connection(format!("feishu ws endpoint: {resp}")))?;

    info!("feishu worker: connecting websocket");
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ChannelError::Connection(e.to_string()))?;
    let (_sink, mut stream) = ws.split();

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = cancel.cancelled() => break,
        };
        let Some(Ok(frame)) = frame else {
            warn!("feishu worker: websocket closed");
            break;
        };
        let WsMessage::Text(text) = frame else { continue };
        let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };

        if payload.pointer("/header/event_type").and_then(|v| v.as_str())
            != Some("im.message.receive_v1")
        {
            continue;
        }

        let Some(inbound) = normalize_event(&payload, &seen) else {
            continue;
        };
        // Bounded queue: back-pressure the socket instead of buffering
        // unboundedly in the worker.
        if tx.send(inbound).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Flatten an `im.message.receive_v1` event into an InboundMessage.
fn normalize_event(payload: &serde_json::Value, seen: &SeenMessages) -> Option<InboundMessage> {
    let message = payload.pointer("/event/message")?;
    let message_id = message.get("message_id")?.as_str()?;
    if seen.check_and_insert(message_id) {
        return None;
    }

    let chat_id = message.get("chat_id")?.as_str()?.to_string();
    let sender_id = payload
        .pointer("/event/sender/sender_id/open_id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    // Text lives JSON-encoded inside `content`.
    let content_raw = message.get("content")?.as_str()?;
    let content: String = serde_json::from_str::<serde_json::Value>(content_raw)
        .ok()?
        .get("text")?
        .as_str()?
        .trim()
        .to_string();
    if content.is_empty() {
        return None;
    }

    let mut inbound = InboundMessage::new("feishu", sender_id, chat_id, content);
    inbound
        .metadata
        .insert("message_id".into(), serde_json::json!(message_id));
    if let Some(chat_type) = message.get("chat_type").and_then(|v| v.as_str()) {
        inbound
            .metadata
            .insert("chat_type".into(), serde_json::json!(chat_type));
    }
    Some(inbound)
}

// ---------------------------------------------------------------------------
// Outbound card rendering
// ---------------------------------------------------------------------------

/// Split a message into markdown segments and pipe-table card elements.
///
/// A table is two or more consecutive `|`-delimited lines whose second line
/// is a `---` separator row. Everything else stays markdown.
pub fn build_card_elements(content: &str) -> Vec<serde_json::Value> {
    let lines: Vec<&str> = content.lines().collect();
    let mut elements: Vec<serde_json::Value> = Vec::new();
    let mut text_buf: Vec<&str> = Vec::new();
    let mut i = 0;

    let flush_text = |buf: &mut Vec<&str>, out: &mut Vec<serde_json::Value>| {
        let text = buf.join("\n").trim().to_string();
        if !text.is_empty() {
            out.push(serde_json::json!({ "tag": "markdown", "content": text }));
        }
        buf.clear();
    };

    while i < lines.len() {
        if is_table_row(lines[i])
            && i + 1 < lines.len()
            && is_separator_row(lines[i + 1])
        {
            // Collect the whole table block.
            let header = parse_row(lines[i]);
            let mut rows: Vec<Vec<String>> = Vec::new();
            let mut j = i + 2;
            while j < lines.len() && is_table_row(lines[j]) {
                rows.push(parse_row(lines[j]));
                j += 1;
            }

            flush_text(&mut text_buf, &mut elements);
            let columns: Vec<serde_json::Value> = header
                .iter()
                .enumerate()
                .map(|(idx, name)| {
                    serde_json::json!({
                        "name": format!("c{idx}"),
                        "display_name": name,
                        "data_type": "text",
                    })
                })
                .collect();
            let row_values: Vec<serde_json::Value> = rows
                .iter()
                .map(|row| {
                    let mut obj = serde_json::Map::new();
                    for (idx, cell) in row.iter().enumerate() {
                        obj.insert(format!("c{idx}"), serde_json::json!(cell));
                    }
                    serde_json::Value::Object(obj)
                })
                .collect();
            elements.push(serde_json::json!({
                "tag": "table",
                "columns": columns,
                "rows": row_values,
            }));
            i = j;
        } else {
            text_buf.push(lines[i]);
            i += 1;
        }
    }
    flush_text(&mut text_buf, &mut elements);
    elements
}

fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|') && trimmed.ends_with('|') && trimmed.len() > 2
}

fn is_separator_row(line: &str) -> bool {
    is_table_row(line)
        && line
            .trim()
            .trim_matches('|')
            .chars()
            .all(|c| matches!(c, '-' | ':' | '|' | ' '))
}

fn parse_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

#[async_trait]
impl Channel for FeishuAdapter {
    fn name(&self) -> &str {
        "feishu"
    }

    async fn start(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<InboundMessage>(WORKER_QUEUE_CAPACITY);
        let worker_cancel = self.shutdown.child_token();
        let worker = tokio::spawn(ws_worker(
            self.client.clone(),
            self.config.app_id.clone(),
            self.config.app_secret.clone(),
            Arc::clone(&self.seen),
            tx,
            worker_cancel,
        ));

        self.running.store(true, Ordering::Relaxed);

        // Drain the worker queue with a short poll so cancellation and a
        // dead worker are both noticed within a second.
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match tokio::time::timeout(QUEUE_READ_TIMEOUT, rx.recv()).await {
                Ok(Some(inbound)) => {
                    if !sender_allowed(&self.config.allow_from, &inbound.sender_id) {
                        warn!(sender = %inbound.sender_id, "feishu: sender not in allowlist");
                        continue;
                    }
                    let callback = self.callback.lock().unwrap().clone();
                    match callback {
                        Some(callback) => callback(inbound),
                        None => warn!("feishu: no message callback set"),
                    }
                }
                Ok(None) => {
                    debug!("feishu: worker queue closed");
                    break;
                }
                Err(_) => continue, // poll timeout
            }
        }

        self.running.store(false, Ordering::Relaxed);
        worker.abort();
        match worker.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.running.store(false, Ordering::Relaxed);
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let token = self.tenant_token().await?;

        let has_table = msg.content.lines().any(is_table_row);
        let (msg_type, content) = if has_table {
            let card = serde_json::json!({
                "config": { "wide_screen_mode": true },
                "elements": build_card_elements(&msg.content),
            });
            ("interactive", card.to_string())
        } else {
            (
                "text",
                serde_json::json!({ "text": msg.content }).to_string(),
            )
        };

        let resp = self
            .client
            .post(format!("{SEND_URL}?receive_id_type=chat_id"))
            .bearer_auth(&token)
            .json(&serde_json::json!({
                "receive_id": msg.chat_id,
                "msg_type": msg_type,
                "content": content,
            }))
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let text = resp.text().await.unwrap_or_default();
            Err(ChannelError::Send(format!("feishu send failed: {text}")))
        }
    }

    async fn test_connection(&self) -> TestConnectionResult {
        match self.tenant_token().await {
            Ok(_) => TestConnectionResult::ok("飞书凭证有效"),
            Err(e) => TestConnectionResult::fail(format!("连接失败: {e}")),
        }
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        sender_allowed(&self.config.allow_from, sender_id)
    }

    fn set_message_callback(&self, callback: InboundCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_are_rejected() {
        assert!(FeishuAdapter::new(&FeishuConfig::default()).is_err());
    }

    #[test]
    fn event_normalisation_extracts_text() {
        let seen = SeenMessages::default();
        let payload = serde_json::json!({
            "header": { "event_type": "im.message.receive_v1" },
            "event": {
                "sender": { "sender_id": { "open_id": "ou_123" } },
                "message": {
                    "message_id": "om_1",
                    "chat_id": "oc_9",
                    "chat_type": "p2p",
                    "content": "{\"text\": \" 你好 \"}",
                }
            }
        });
        let inbound = normalize_event(&payload, &seen).unwrap();
        assert_eq!(inbound.channel, "feishu");
        assert_eq!(inbound.sender_id, "ou_123");
        assert_eq!(inbound.chat_id, "oc_9");
        assert_eq!(inbound.content, "你好");

        // Same message id again is dropped.
        assert!(normalize_event(&payload, &seen).is_none());
    }

    #[test]
    fn plain_markdown_yields_one_element() {
        let elements = build_card_elements("hello **world**\nsecond line");
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0]["tag"], "markdown");
    }

    #[test]
    fn pipe_table_is_lifted_into_a_table_element() {
        let content = "结果如下：\n| 名称 | 数量 |\n| --- | --- |\n| 苹果 | 3 |\n| 梨 | 5 |\n完毕。";
        let elements = build_card_elements(content);
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0]["tag"], "markdown");
        assert_eq!(elements[1]["tag"], "table");
        assert_eq!(elements[2]["tag"], "markdown");

        let columns = elements[1]["columns"].as_array().unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0]["display_name"], "名称");
        let rows = elements[1]["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["c0"], "苹果");
        assert_eq!(rows[1]["c1"], "5");
    }

    #[test]
    fn lone_pipe_line_stays_markdown() {
        let elements = build_card_elements("| not a table |");
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0]["tag"], "markdown");
    }

    #[test]
    fn separator_detection() {
        assert!(is_separator_row("| --- | :--: |"));
        assert!(!is_separator_row("| a | b |"));
    }
}
