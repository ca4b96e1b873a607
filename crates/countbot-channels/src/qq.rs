//! QQ open-platform bot adapter.
//!
//! Inbound rides the official WebSocket gateway (identify → heartbeat →
//! dispatch). Outbound goes through the REST API, preferring passive replies:
//! within QQ's ~5-minute window a reply may embed the originating `msg_id`
//! and is exempt from active-message rate caps. Markdown sends that the
//! platform rejects are retried as plain text.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use countbot_core::config::QqConfig;
use countbot_core::types::{InboundMessage, OutboundMessage};

use crate::channel::{sender_allowed, Channel, InboundCallback, TestConnectionResult};
use crate::dedup::SeenMessages;
use crate::error::{ChannelError, Result};

const TOKEN_URL: &str = "https://bots.qq.com/app/getAppAccessToken";
const API_BASE: &str = "https://api.sgroup.qq.com";
/// Group/C2C message intent bit.
const GROUP_AND_C2C_INTENT: u64 = 1 << 25;
/// QQ allows passive replies for roughly five minutes.
const PASSIVE_WINDOW_SECS: u64 = 300;
/// Reply contexts kept per adapter before the oldest is dropped.
const MAX_REPLY_CONTEXTS: usize = 200;
/// Refresh the app access token this long before it expires.
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

#[derive(Clone)]
struct ReplyContext {
    msg_id: Option<String>,
    event_id: Option<String>,
    is_group: bool,
    cached_at: Instant,
}

struct TokenCache {
    token: String,
    expires_at: Instant,
}

pub struct QqAdapter {
    config: QqConfig,
    client: reqwest::Client,
    callback: Mutex<Option<InboundCallback>>,
    seen: SeenMessages,
    reply_contexts: Mutex<HashMap<String, ReplyContext>>,
    token: tokio::sync::Mutex<Option<TokenCache>>,
    msg_seq: AtomicU64,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl QqAdapter {
    pub fn new(config: &QqConfig) -> Result<Self> {
        if config.app_id.is_empty() || config.secret.is_empty() {
            return Err(ChannelError::NotConfigured("qq app_id/secret".into()));
        }
        Ok(Self {
            config: config.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            callback: Mutex::new(None),
            seen: SeenMessages::default(),
            reply_contexts: Mutex::new(HashMap::new()),
            token: tokio::sync::Mutex::new(None),
            msg_seq: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Current app access token, refreshed proactively before expiry.
    async fn access_token(&self) -> Result<String> {
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
                "appId": self.config.app_id,
                "clientSecret": self.config.secret,
            }))
            .send()
            .await?
            .json()
            .await?;

        let token = resp
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::Auth(format!("qq token response: {resp}")))?
            .to_string();
        let expires_in = resp
            .get("expires_in")
            .and_then(|v| {
                // The platform returns this as a string; tolerate numbers too.
                v.as_str()
                    .and_then(|s| s.parse::<u64>().ok())
                    .or_else(|| v.as_u64())
            })
            .unwrap_or(7200);

        *cache = Some(TokenCache {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(token)
    }

    async fn gateway_url(&self, token: &str) -> Result<String> {
        let resp: serde_json::Value = self
            .client
            .get(format!("{API_BASE}/gateway"))
            .header("Authorization", format!("QQBot {token}"))
            .send()
            .await?
            .json()
            .await?;
        resp.get("url")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| ChannelError::Connection(format!("qq gateway response: {resp}")))
    }

    fn remember_reply_context(&self, chat_id: &str, context: ReplyContext) {
        let mut contexts = self.reply_contexts.lock().unwrap();
        if contexts.len() >= MAX_REPLY_CONTEXTS && !contexts.contains_key(chat_id) {
            let oldest = contexts
                .iter()
                .min_by_key(|(_, c)| c.cached_at)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                contexts.remove(&key);
            }
        }
        contexts.insert(chat_id.to_string(), context);
    }

    /// A reply context still inside the passive window, if any.
    fn reply_context(&self, chat_id: &str) -> Option<ReplyContext> {
        let contexts = self.reply_contexts.lock().unwrap();
        let context = contexts.get(chat_id)?;
        if context.cached_at.elapsed() > Duration::from_secs(PASSIVE_WINDOW_SECS) {
            return None;
        }
        Some(context.clone())
    }

    fn handle_dispatch(&self, event_type: &str, data: &serde_json::Value) {
        let is_group = event_type == "GROUP_AT_MESSAGE_CREATE";
        let message_id = data.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        if message_id.is_empty() || self.seen.check_and_insert(message_id) {
            return;
        }

        let author = data.get("author").cloned().unwrap_or_default();
        let sender_id = author
            .get("id")
            .or_else(|| author.get("user_openid"))
            .or_else(|| author.get("member_openid"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let content = data
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            return;
        }

        let chat_id = if is_group {
            data.get("group_openid")
                .and_then(|v| v.as_str())
                .unwrap_or(&sender_id)
                .to_string()
        } else {
            sender_id.clone()
        };

        if !sender_allowed(&self.config.allow_from, &sender_id) {
            warn!(sender = %sender_id, "qq: sender not in allowlist");
            return;
        }

        self.remember_reply_context(
            &chat_id,
            ReplyContext {
                msg_id: Some(message_id.to_string()),
                event_id: data.get("event_id").and_then(|v| v.as_str()).map(String::from),
                is_group,
                cached_at: Instant::now(),
            },
        );

        let mut inbound = InboundMessage::new("qq", sender_id, chat_id, content);
        inbound
            .metadata
            .insert("is_group".into(), serde_json::json!(is_group));
        inbound
            .metadata
            .insert("message_id".into(), serde_json::json!(message_id));

        let callback = self.callback.lock().unwrap().clone();
        match callback {
            Some(callback) => callback(inbound),
            None => warn!("qq: no message callback set"),
        }
    }

    /// POST a message payload, downgrading markdown to plain text when the
    /// platform rejects it.
    async fn post_message(
        &self,
        url: &str,
        chat_id: &str,
        content: &str,
        context: Option<&ReplyContext>,
        use_markdown: bool,
    ) -> Result<()> {
        let token = self.access_token().await?;
        let mut body = serde_json::json!({
            "msg_type": if use_markdown { 2 } else { 0 },
            "msg_seq": self.msg_seq.fetch_add(1, Ordering::Relaxed),
        });
        if use_markdown {
            body["markdown"] = serde_json::json!({ "content": content });
        } else {
            body["content"] = serde_json::json!(content);
        }
        if let Some(context) = context {
            if let Some(ref msg_id) = context.msg_id {
                body["msg_id"] = serde_json::json!(msg_id);
            }
            if let Some(ref event_id) = context.event_id {
                body["event_id"] = serde_json::json!(event_id);
            }
        }

        let resp = self
            .client
            .post(url)
            .header("Authorization", format!("QQBot {token}"))
            .json(&body)
            .send()
            .await?;

        if resp.status().is_success() {
            return Ok(());
        }
        let error_text = resp.text().await.unwrap_or_default();
        log_error_hint(&error_text);

        // Markdown rejected: retry the same payload as plain text.
        if use_markdown && (error_text.contains("11255") || error_text.contains("invalid request"))
        {
            info!(chat = %chat_id, "qq: markdown rejected, retrying as plain text");
            return Box::pin(self.post_message(url, chat_id, content, context, false)).await;
        }

        Err(ChannelError::Send(format!("qq send failed: {error_text}")))
    }
}

/// Friendly hints for the QQ platform's more cryptic error codes.
fn log_error_hint(error_text: &str) {
    let hints = [
        ("40054005", "message dedup: QQ has strict limits on private messages"),
        ("11255", "private chat only supports passive reply within the 5 min window"),
        ("22009", "rate limit: 4 active msgs/month, 5 passive msgs per 5 min"),
        ("304082", "rich media fetch failed, check file path and format"),
        ("304083", "rich media fetch failed, check file path and format"),
    ];
    for (code, hint) in hints {
        if error_text.contains(code) {
            warn!(code, "qq: {hint}");
            return;
        }
    }
}

#[async_trait]
impl Channel for QqAdapter {
    fn name(&self) -> &str {
        "qq"
    }

    async fn start(&self) -> Result<()> {
        let token = self.access_token().await?;
        let gateway = self.gateway_url(&token).await?;
        info!(gateway = %gateway, "qq: connecting to websocket gateway");

        let (ws, _) = tokio_tungstenite::connect_async(&gateway)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();
        self.running.store(true, Ordering::Relaxed);

        let mut heartbeat_interval = Duration::from_secs(45);
        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut last_seq: Option<u64> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat_timer.tick() => {
                    let heartbeat = serde_json::json!({ "op": 1, "d": last_seq });
                    if sink.send(WsMessage::Text(heartbeat.to_string().into())).await.is_err() {
                        break;
                    }
                }
                frame = stream.next() => {
                    let Some(Ok(frame)) = frame else {
                        warn!("qq: websocket closed");
                        break;
                    };
                    let WsMessage::Text(text) = frame else { continue };
                    let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };

                    if let Some(seq) = payload.get("s").and_then(|v| v.as_u64()) {
                        last_seq = Some(seq);
                    }

                    match payload.get("op").and_then(|v| v.as_u64()) {
                        // Hello: adopt the server's heartbeat cadence, then identify.
                        Some(10) => {
                            if let Some(ms) = payload
                                .pointer("/d/heartbeat_interval")
                                .and_then(|v| v.as_u64())
                            {
                                heartbeat_interval = Duration::from_millis(ms);
                                heartbeat_timer = tokio::time::interval(heartbeat_interval);
                            }
                            let token = self.access_token().await?;
                            let identify = serde_json::json!({
                                "op": 2,
                                "d": {
                                    "token": format!("QQBot {token}"),
                                    "intents": GROUP_AND_C2C_INTENT,
                                    "shard": [0, 1],
                                }
                            });
                            sink.send(WsMessage::Text(identify.to_string().into()))
                                .await
                                .map_err(|e| ChannelError::Connection(e.to_string()))?;
                        }
                        // Dispatch.
                        Some(0) => {
                            let event_type = payload
                                .get("t")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string();
                            if event_type == "READY" {
                                info!("qq: gateway ready");
                            } else if let Some(data) = payload.get("d") {
                                self.handle_dispatch(&event_type, data);
                            }
                        }
                        // Reconnect request.
                        Some(7) => {
                            warn!("qq: server requested reconnect");
                            break;
                        }
                        Some(11) => debug!("qq: heartbeat ack"),
                        _ => {}
                    }
                }
            }
        }

        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.running.store(false, Ordering::Relaxed);
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let context = self.reply_context(&msg.chat_id);
        let is_group = context
            .as_ref()
            .map(|c| c.is_group)
            .or_else(|| {
                msg.metadata
                    .get("is_group")
                    .and_then(|v| v.as_bool())
            })
            .unwrap_or(false);

        let url = if is_group {
            format!("{API_BASE}/v2/groups/{}/messages", msg.chat_id)
        } else {
            format!("{API_BASE}/v2/users/{}/messages", msg.chat_id)
        };

        let use_markdown = if is_group {
            self.config.markdown_enabled && self.config.group_markdown_enabled
        } else {
            self.config.markdown_enabled
        };

        if context.is_none() {
            // Outside the passive window this counts against the platform's
            // active-message caps; error hints explain any rejection.
            debug!(chat = %msg.chat_id, "qq: sending as active message");
        }

        self.post_message(&url, &msg.chat_id, &msg.content, context.as_ref(), use_markdown)
            .await
    }

    async fn test_connection(&self) -> TestConnectionResult {
        match self.access_token().await {
            Ok(_) => TestConnectionResult::ok("QQ 凭证有效"),
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
