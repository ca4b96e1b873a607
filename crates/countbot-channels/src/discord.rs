//! Discord adapter: serenity gateway for inbound, REST for outbound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serenity::builder::{CreateAttachment, CreateMessage};
use serenity::model::channel::Message as DiscordMessage;
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::id::ChannelId;
use serenity::prelude::{Context as SerenityContext, EventHandler};
use serenity::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use countbot_core::config::DiscordConfig;
use countbot_core::types::{InboundMessage, OutboundMessage};

use crate::channel::{sender_allowed, split_chunks, Channel, InboundCallback, TestConnectionResult};
use crate::dedup::SeenMessages;
use crate::error::{ChannelError, Result};

/// Discord's message limit.
const CHUNK_MAX: usize = 2000;

struct DiscordState {
    allow_from: Vec<String>,
    callback: Mutex<Option<InboundCallback>>,
    seen: SeenMessages,
}

struct GatewayHandler {
    state: Arc<DiscordState>,
}

#[serenity::async_trait]
impl EventHandler for GatewayHandler {
    async fn ready(&self, _ctx: SerenityContext, ready: Ready) {
        info!(name = %ready.user.name, "discord bot connected");
    }

    async fn message(&self, _ctx: SerenityContext, msg: DiscordMessage) {
        if msg.author.bot {
            return;
        }

        let sender_id = match msg.author.name.as_str() {
            "" => msg.author.id.to_string(),
            name => format!("{}|{}", msg.author.id, name),
        };
        if !sender_allowed(&self.state.allow_from, &sender_id) {
            warn!(sender = %sender_id, "discord: sender not in allowlist");
            return;
        }

        if self.state.seen.check_and_insert(&msg.id.to_string()) {
            return;
        }

        let content = msg.content.trim().to_string();
        if content.is_empty() {
            return;
        }

        let inbound = InboundMessage::new(
            "discord",
            sender_id,
            msg.channel_id.to_string(),
            content,
        );

        let callback = self.state.callback.lock().unwrap().clone();
        match callback {
            Some(callback) => callback(inbound),
            None => warn!("discord: no message callback set"),
        }
    }
}

pub struct DiscordAdapter {
    config: DiscordConfig,
    http: Arc<serenity::http::Http>,
    state: Arc<DiscordState>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl DiscordAdapter {
    pub fn new(config: &DiscordConfig) -> Result<Self> {
        if config.token.is_empty() {
            return Err(ChannelError::NotConfigured("discord token".into()));
        }
        Ok(Self {
            http: Arc::new(serenity::http::Http::new(&config.token)),
            state: Arc::new(DiscordState {
                allow_from: config.allow_from.clone(),
                callback: Mutex::new(None),
                seen: SeenMessages::default(),
            }),
            config: config.clone(),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Channel for DiscordAdapter {
    fn name(&self) -> &str {
        "discord"
    }

    async fn start(&self) -> Result<()> {
        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = Client::builder(&self.config.token, intents)
            .event_handler(GatewayHandler {
                state: Arc::clone(&self.state),
            })
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;

        info!("discord: gateway connecting");
        self.running.store(true, Ordering::Relaxed);

        let result = tokio::select! {
            result = client.start() => result.map_err(|e| ChannelError::Connection(e.to_string())),
            _ = self.shutdown.cancelled() => Ok(()),
        };

        self.running.store(false, Ordering::Relaxed);
        result
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.running.store(false, Ordering::Relaxed);
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let channel_id: u64 = msg
            .chat_id
            .parse()
            .map_err(|_| ChannelError::Send(format!("invalid discord channel id: {}", msg.chat_id)))?;
        let channel = ChannelId::new(channel_id);

        if !msg.media.is_empty() {
            let mut message = CreateMessage::new();
            for path in &msg.media {
                match CreateAttachment::path(path).await {
                    Ok(attachment) => message = message.add_file(attachment),
                    Err(e) => warn!(path = %path, error = %e, "discord: failed to attach media"),
                }
            }
            channel
                .send_message(&self.http, message)
                .await
                .map_err(|e| ChannelError::Send(e.to_string()))?;
        }

        for chunk in split_chunks(&msg.content, CHUNK_MAX) {
            channel
                .say(&self.http, chunk)
                .await
                .map_err(|e| ChannelError::Send(e.to_string()))?;
        }
        Ok(())
    }

    async fn test_connection(&self) -> TestConnectionResult {
        match self.http.get_current_user().await {
            Ok(user) => {
                let mut result = TestConnectionResult::ok(format!("已连接: {}", user.name));
                result.bot_info = Some(serde_json::json!({
                    "id": user.id.to_string(),
                    "username": user.name,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_is_rejected() {
        assert!(DiscordAdapter::new(&DiscordConfig::default()).is_err());
    }

    #[test]
    fn allowlist_accepts_composite_ids() {
        let config = DiscordConfig {
            enabled: true,
            token: "t".into(),
            allow_from: vec!["alice".into()],
        };
        let adapter = DiscordAdapter::new(&config).unwrap();
        assert!(adapter.is_allowed("123|alice"));
        assert!(!adapter.is_allowed("123|bob"));
    }
}
