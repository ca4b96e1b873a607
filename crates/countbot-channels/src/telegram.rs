//! Telegram adapter: teloxide long-polling dispatcher.
//!
//! Outbound messages are sent as MarkdownV2 with a plain-text fallback when
//! Telegram rejects the parse mode, split into code-fence-aware chunks under
//! the 4096-character limit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{InputFile, ParseMode};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use countbot_core::config::TelegramConfig;
use countbot_core::types::{InboundMessage, OutboundMessage};

use crate::channel::{sender_allowed, split_chunks, Channel, InboundCallback, TestConnectionResult};
use crate::dedup::SeenMessages;
use crate::error::{ChannelError, Result};

/// Telegram's limit is 4096; a little headroom avoids off-by-escape errors.
const CHUNK_MAX: usize = 4090;

const HELP_TEXT: &str = "你好！直接发消息即可对话。\n\
    /help 查看命令，/new 新建会话，/stop 停止当前任务。";

struct TelegramState {
    allow_from: Vec<String>,
    callback: Mutex<Option<InboundCallback>>,
    seen: SeenMessages,
}

pub struct TelegramAdapter {
    config: TelegramConfig,
    bot: Bot,
    state: Arc<TelegramState>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(ChannelError::NotConfigured("telegram token".into()));
        }

        let bot = match &config.proxy {
            Some(proxy_url) if !proxy_url.is_empty() => {
                let client = reqwest::Client::builder()
                    .proxy(
                        reqwest::Proxy::all(proxy_url)
                            .map_err(|e| ChannelError::NotConfigured(format!("bad proxy: {e}")))?,
                    )
                    .timeout(Duration::from_secs(60))
                    .build()
                    .map_err(ChannelError::Http)?;
                Bot::with_client(&config.token, client)
            }
            _ => Bot::new(&config.token),
        };

        Ok(Self {
            state: Arc::new(TelegramState {
                allow_from: config.allow_from.clone(),
                callback: Mutex::new(None),
                seen: SeenMessages::default(),
            }),
            config: config.clone(),
            bot,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Channel for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<()> {
        info!("telegram: starting long-polling dispatcher");
        self.running.store(true, Ordering::Relaxed);

        let handler = Update::filter_message().endpoint(on_message);
        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![Arc::clone(&self.state)])
            .default_handler(|_upd| async {})
            .build();

        tokio::select! {
            _ = dispatcher.dispatch() => {}
            _ = self.shutdown.cancelled() => {}
        }

        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.running.store(false, Ordering::Relaxed);
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let chat_id: i64 = msg
            .chat_id
            .parse()
            .map_err(|_| ChannelError::Send(format!("invalid telegram chat id: {}", msg.chat_id)))?;
        let chat = ChatId(chat_id);

        for path in &msg.media {
            if let Err(e) = self
                .bot
                .send_document(chat, InputFile::file(path.clone()))
                .await
            {
                warn!(path = %path, error = %e, "telegram: failed to send media");
            }
        }

        if !msg.content.is_empty() {
            send_text(&self.bot, chat, &msg.content).await;
        }
        Ok(())
    }

    async fn test_connection(&self) -> TestConnectionResult {
        match self.bot.get_me().await {
            Ok(me) => {
                let username = me.user.username.clone().unwrap_or_default();
                let mut result = TestConnectionResult::ok(format!("已连接: @{username}"));
                result.bot_info = Some(serde_json::json!({
                    "id": me.user.id.0,
                    "username": username,
                }));
                result
            }
            Err(e) => TestConnectionResult::fail(format!("连接失败: {e}")),
        }
    }

    fn is_allowed(&self, sender_id: &str) -> bool {
        sender_allowed(&self.config.allow_from, sender_id)
    }

    fn set_message_callback(&self, callback: InboundCallback) {
        *self.state.callback.lock().unwrap() = Some(callback);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

async fn on_message(bot: Bot, msg: Message, state: Arc<TelegramState>) -> ResponseResult<()> {
    // Ignore other bots.
    if msg.from.as_ref().map(|u| u.is_bot).unwrap_or(false) {
        return Ok(());
    }
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };

    // Composite sender id: numeric id plus username when present.
    let sender_id = match from.username.as_deref() {
        Some(username) if !username.is_empty() => format!("{}|{}", from.id.0, username),
        _ => from.id.0.to_string(),
    };

    if !sender_allowed(&state.allow_from, &sender_id) {
        warn!(sender = %sender_id, "telegram: sender not in allowlist");
        return Ok(());
    }

    // Telegram redelivers updates after reconnects.
    let provider_id = format!("{}:{}", msg.chat.id.0, msg.id.0);
    if state.seen.check_and_insert(&provider_id) {
        return Ok(());
    }

    let text = msg.text().or(msg.caption()).unwrap_or("").to_string();
    if text.is_empty() {
        return Ok(());
    }

    // /start and /help are answered locally; everything else (including the
    // session commands) flows through the shared handler.
    if text == "/start" || text == "/help" {
        send_text(&bot, msg.chat.id, HELP_TEXT).await;
        return Ok(());
    }

    let inbound = InboundMessage::new("telegram", sender_id, msg.chat.id.0.to_string(), text);

    let callback = state.callback.lock().unwrap().clone();
    match callback {
        Some(callback) => callback(inbound),
        None => warn!("telegram: no message callback set"),
    }
    Ok(())
}

/// Escape the characters MarkdownV2 treats as markup.
fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '#' | '+' | '-' | '=' | '|' | '{'
            | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Send `text` in chunks, MarkdownV2 first with plain-text fallback.
async fn send_text(bot: &Bot, chat: ChatId, text: &str) {
    let chunks = split_chunks(text, CHUNK_MAX);
    for (i, chunk) in chunks.iter().enumerate() {
        let escaped = escape_markdown_v2(chunk);
        let sent = bot
            .send_message(chat, &escaped)
            .parse_mode(ParseMode::MarkdownV2)
            .await;

        if sent.is_err() {
            if let Err(e) = bot.send_message(chat, chunk).await {
                warn!(error = %e, chunk = i, "telegram: plain-text fallback failed");
            }
        }

        if i + 1 < chunks.len() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_escape_covers_specials() {
        let escaped = escape_markdown_v2("a.b!c(d)e[f]");
        assert_eq!(escaped, "a\\.b\\!c\\(d\\)e\\[f\\]");
    }

    #[test]
    fn markdown_escape_leaves_plain_text() {
        assert_eq!(escape_markdown_v2("你好 world 123"), "你好 world 123");
    }

    #[test]
    fn missing_token_is_rejected() {
        let config = TelegramConfig::default();
        assert!(TelegramAdapter::new(&config).is_err());
    }

    #[test]
    fn allowlist_uses_the_shared_matcher() {
        let config = TelegramConfig {
            enabled: true,
            token: "123:abc".into(),
            proxy: None,
            allow_from: vec!["42".into()],
        };
        let adapter = TelegramAdapter::new(&config).unwrap();
        assert!(adapter.is_allowed("42"));
        assert!(adapter.is_allowed("42|alice"));
        assert!(!adapter.is_allowed("7"));
    }
}
