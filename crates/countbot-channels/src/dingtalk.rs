//! DingTalk adapter: stream-mode WebSocket inbound, webhook-first outbound.
//!
//! Replies prefer the per-session `sessionWebhook` captured from the inbound
//! event while it is still valid; afterwards they fall back to the OpenAPI
//! robot endpoints. Access tokens are cached and refreshed at least 60 s
//! before expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use countbot_core::config::DingTalkConfig;
use countbot_core::types::{InboundMessage, OutboundMessage};

use crate::channel::{sender_allowed, Channel, InboundCallback, TestConnectionResult};
use crate::dedup::SeenMessages;
use crate::error::{ChannelError, Result};

const GATEWAY_URL: &str = "https://api.dingtalk.com/v1.0/gateway/connections";
const TOKEN_URL: &str = "https://api.dingtalk.com/v1.0/oauth2/accessToken";
const GROUP_SEND_URL: &str = "https://api.dingtalk.com/v1.0/robot/groupMessages/send";
const PRIVATE_SEND_URL: &str = "https://api.dingtalk.com/v1.0/robot/oToMessages/batchSend";
const BOT_TOPIC: &str = "/v1.0/im/bot/messages/get";
/// Refresh the access token this long before it expires.
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

#[derive(Clone)]
struct SessionWebhook {
    url: String,
    /// Milliseconds since epoch after which the webhook is dead.
    expired_at_ms: u64,
    sender_staff_id: String,
    is_group: bool,
}

struct TokenCache {
    token: String,
    expires_at: Instant,
}

pub struct DingTalkAdapter {
    config: DingTalkConfig,
    client: reqwest::Client,
    callback: Mutex<Option<InboundCallback>>,
    seen: SeenMessages,
    webhooks: Mutex<HashMap<String, SessionWebhook>>,
    token: tokio::sync::Mutex<Option<TokenCache>>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl DingTalkAdapter {
    pub fn new(config: &DingTalkConfig) -> Result<Self> {
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            return Err(ChannelError::NotConfigured("dingtalk client_id/secret".into()));
        }
        Ok(Self {
            config: config.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            callback: Mutex::new(None),
            seen: SeenMessages::default(),
            webhooks: Mutex::new(HashMap::new()),
            token: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }

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
                "appKey": self.config.client_id,
                "appSecret": self.config.client_secret,
            }))
            .send()
            .await?
            .json()
            .await?;

        let token = resp
            .get("accessToken")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ChannelError::Auth(format!("dingtalk token response: {resp}")))?
            .to_string();
        let expires_in = resp.get("expireIn").and_then(|v| v.as_u64()).unwrap_or(7200);

        *cache = Some(TokenCache {
            token: token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(token)
    }

    /// Open a stream-mode connection: register for the bot topic, then
    /// connect to the returned endpoint with its ticket.
    async fn open_connection(&self) -> Result<String> {
        let resp: serde_json::Value = self
            .client
            .post(GATEWAY_URL)
            .json(&serde_json::json!({
                "clientId": self.config.client_id,
                "clientSecret": self.config.client_secret,
                "subscriptions": [{ "type": "CALLBACK", "topic": BOT_TOPIC }],
            }))
            .send()
            .await?
            .json()
            .await?;

        let endpoint = resp.get("endpoint").and_then(|v| v.as_str());
        let ticket = resp.get("ticket").and_then(|v| v.as_str());
        match (endpoint, ticket) {
            (Some(endpoint), Some(ticket)) => Ok(format!("{endpoint}?ticket={ticket}")),
            _ => Err(ChannelError::Connection(format!(
                "dingtalk gateway response: {resp}"
            ))),
        }
    }

    fn handle_callback(&self, data: &serde_json::Value) {
        let message_id = data.get("msgId").and_then(|v| v.as_str()).unwrap_or_default();
        if !message_id.is_empty() && self.seen.check_and_insert(message_id) {
            return;
        }

        let sender_id = data
            .get("senderStaffId")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        if !sender_allowed(&self.config.allow_from, &sender_id) {
            warn!(sender = %sender_id, "dingtalk: sender not in allowlist");
            return;
        }

        let conversation_id = data
            .get("conversationId")
            .and_then(|v| v.as_str())
            .unwrap_or(&sender_id)
            .to_string();
        let is_group = data.get("conversationType").and_then(|v| v.as_str()) == Some("2");

        let content = data
            .pointer("/text/content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            return;
        }

        // Cache the per-session webhook for fast replies while it lasts.
        if let Some(webhook_url) = data.get("sessionWebhook").and_then(|v| v.as_str()) {
            let expired_at_ms = data
                .get("sessionWebhookExpiredTime")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            self.webhooks.lock().unwrap().insert(
                conversation_id.clone(),
                SessionWebhook {
                    url: webhook_url.to_string(),
                    expired_at_ms,
                    sender_staff_id: sender_id.clone(),
                    is_group,
                },
            );
        }

        let mut inbound =
            InboundMessage::new("dingtalk", sender_id, conversation_id, content);
        inbound
            .metadata
            .insert("is_group".into(), serde_json::json!(is_group));

        let callback = self.callback.lock().unwrap().clone();
        match callback {
            Some(callback) => callback(inbound),
            None => warn!("dingtalk: no message callback set"),
        }
    }

    /// Webhook-first send. Returns `false` when the webhook is absent or
    /// stale so the caller can fall back to the OpenAPI.
    async fn send_via_webhook(&self, msg: &OutboundMessage) -> bool {
        let webhook = {
            let webhooks = self.webhooks.lock().unwrap();
            webhooks.get(&msg.chat_id).cloned()
        };
        let Some(webhook) = webhook else {
            return false;
        };

        if webhook.expired_at_ms > 0 && now_ms() > webhook.expired_at_ms {
            debug!(chat = %msg.chat_id, "dingtalk: sessionWebhook expired");
            return false;
        }

        let body = serde_json::json!({
            "msgtype": "markdown",
            "markdown": { "title": "回复", "text": msg.content },
        });
        match self.client.post(&webhook.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(chat = %msg.chat_id, "dingtalk: sent via sessionWebhook");
                true
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "dingtalk: sessionWebhook rejected, falling back");
                false
            }
            Err(e) => {
                warn!(error = %e, "dingtalk: sessionWebhook failed, falling back");
                false
            }
        }
    }

    async fn send_via_openapi(&self, msg: &OutboundMessage) -> Result<()> {
        let token = self.access_token().await?;
        let webhook = {
            let webhooks = self.webhooks.lock().unwrap();
            webhooks.get(&msg.chat_id).cloned()
        };
        let is_group = webhook.as_ref().map(|w| w.is_group).unwrap_or(true);

        let msg_param = serde_json::json!({ "title": "回复", "text": msg.content }).to_string();
        let body = if is_group {
            serde_json::json!({
                "robotCode": self.config.client_id,
                "openConversationId": msg.chat_id,
                "msgKey": "sampleMarkdown",
                "msgParam": msg_param,
            })
        } else {
            let user_id = webhook
                .map(|w| w.sender_staff_id)
                .unwrap_or_else(|| msg.chat_id.clone());
            serde_json::json!({
                "robotCode": self.config.client_id,
                "userIds": [user_id],
                "msgKey": "sampleMarkdown",
                "msgParam": msg_param,
            })
        };

        let url = if is_group { GROUP_SEND_URL } else { PRIVATE_SEND_URL };
        let resp = self
            .client
            .post(url)
            .header("x-acs-dingtalk-access-token", token)
            .json(&body)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let text = resp.text().await.unwrap_or_default();
            Err(ChannelError::Send(format!("dingtalk openapi send: {text}")))
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl Channel for DingTalkAdapter {
    fn name(&self) -> &str {
        "dingtalk"
    }

    async fn start(&self) -> Result<()> {
        let url = self.open_connection().await?;
        info!("dingtalk: connecting stream-mode websocket");

        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();
        self.running.store(true, Ordering::Relaxed);

        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = self.shutdown.cancelled() => break,
            };
            let Some(Ok(frame)) = frame else {
                warn!("dingtalk: websocket closed");
                break;
            };
            let WsMessage::Text(text) = frame else { continue };
            let Ok(payload) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };

            let frame_type = payload
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let message_id = payload
                .pointer("/headers/messageId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            match frame_type {
                "SYSTEM" => {
                    // Ping frames expect a pong ack carrying the same data.
                    let ack = serde_json::json!({
                        "code": 200,
                        "headers": { "contentType": "application/json", "messageId": message_id },
                        "message": "OK",
                        "data": payload.get("data").cloned().unwrap_or_default(),
                    });
                    if sink.send(WsMessage::Text(ack.to_string().into())).await.is_err() {
                        break;
                    }
                }
                "CALLBACK" => {
                    if let Some(data) = payload
                        .get("data")
                        .and_then(|v| v.as_str())
                        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
                    {
                        self.handle_callback(&data);
                    }
                    let ack = serde_json::json!({
                        "code": 200,
                        "headers": { "contentType": "application/json", "messageId": message_id },
                        "message": "OK",
                        "data": "{}",
                    });
                    if sink.send(WsMessage::Text(ack.to_string().into())).await.is_err() {
                        break;
                    }
                }
                _ => debug!(frame_type, "dingtalk: unhandled frame"),
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
        if self.send_via_webhook(msg).await {
            return Ok(());
        }
        self.send_via_openapi(msg).await
    }

    async fn test_connection(&self) -> TestConnectionResult {
        match self.access_token().await {
            Ok(_) => TestConnectionResult::ok("钉钉凭证有效"),
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

    fn adapter() -> DingTalkAdapter {
        DingTalkAdapter::new(&DingTalkConfig {
            enabled: true,
            client_id: "cid".into(),
            client_secret: "cs".into(),
            allow_from: vec![],
        })
        .unwrap()
    }

    #[test]
    fn missing_credentials_are_rejected() {
        assert!(DingTalkAdapter::new(&DingTalkConfig::default()).is_err());
    }

    #[test]
    fn callback_normalises_group_message_and_caches_webhook() {
        let a = adapter();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        a.set_message_callback(Arc::new(move |msg| {
            sink.lock().unwrap().push(msg);
        }));

        a.handle_callback(&serde_json::json!({
            "msgId": "m-1",
            "senderStaffId": "staff-7",
            "conversationId": "cid-99",
            "conversationType": "2",
            "text": { "content": " 帮我排个会 " },
            "sessionWebhook": "https://oapi.dingtalk.com/robot/sendBySession?x=1",
            "sessionWebhookExpiredTime": now_ms() + 90_000u64,
        }));

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].channel, "dingtalk");
        assert_eq!(received[0].sender_id, "staff-7");
        assert_eq!(received[0].chat_id, "cid-99");
        assert_eq!(received[0].content, "帮我排个会");

        let webhooks = a.webhooks.lock().unwrap();
        let cached = webhooks.get("cid-99").unwrap();
        assert!(cached.is_group);
        assert_eq!(cached.sender_staff_id, "staff-7");
    }

    #[test]
    fn duplicate_msg_ids_are_dropped() {
        let a = adapter();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        a.set_message_callback(Arc::new(move |_| {
            *sink.lock().unwrap() += 1;
        }));

        let payload = serde_json::json!({
            "msgId": "dup",
            "senderStaffId": "s",
            "conversationId": "c",
            "conversationType": "1",
            "text": { "content": "hi" },
        });
        a.handle_callback(&payload);
        a.handle_callback(&payload);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_webhook_is_not_used() {
        let a = adapter();
        a.webhooks.lock().unwrap().insert(
            "c1".into(),
            SessionWebhook {
                url: "https://example.invalid/hook".into(),
                expired_at_ms: 1, // long past
                sender_staff_id: "s".into(),
                is_group: false,
            },
        );
        let msg = OutboundMessage::text("dingtalk", "c1", "hello");
        assert!(!a.send_via_webhook(&msg).await);
    }
}
