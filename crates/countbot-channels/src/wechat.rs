//! WeChat adapter stub.
//!
//! WeChat's official-account API needs a public callback URL, which this
//! deployment does not assume. The adapter satisfies the channel contract so
//! configuration, status, and routing behave uniformly; `start` parks until
//! cancelled and `send` reports the channel as unavailable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use countbot_core::config::WeChatConfig;
use countbot_core::types::OutboundMessage;

use crate::channel::{sender_allowed, Channel, InboundCallback, TestConnectionResult};
use crate::error::{ChannelError, Result};

pub struct WeChatAdapter {
    config: WeChatConfig,
    callback: Mutex<Option<InboundCallback>>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl WeChatAdapter {
    pub fn new(config: &WeChatConfig) -> Result<Self> {
        if config.app_id.is_empty() || config.app_secret.is_empty() {
            return Err(ChannelError::NotConfigured("wechat app_id/secret".into()));
        }
        Ok(Self {
            config: config.clone(),
            callback: Mutex::new(None),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Channel for WeChatAdapter {
    fn name(&self) -> &str {
        "wechat"
    }

    async fn start(&self) -> Result<()> {
        warn!("wechat: adapter is a stub; no inbound events will arrive");
        self.running.store(true, Ordering::Relaxed);
        self.shutdown.cancelled().await;
        self.running.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        self.running.store(false, Ordering::Relaxed);
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        Err(ChannelError::Send(format!(
            "wechat channel cannot deliver to {}: adapter not implemented",
            msg.chat_id
        )))
    }

    async fn test_connection(&self) -> TestConnectionResult {
        TestConnectionResult::fail("微信渠道暂未实现")
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
        assert!(WeChatAdapter::new(&WeChatConfig::default()).is_err());
    }

    #[tokio::test]
    async fn send_reports_unavailable() {
        let adapter = WeChatAdapter::new(&WeChatConfig {
            enabled: true,
            app_id: "a".into(),
            app_secret: "s".into(),
            allow_from: vec![],
        })
        .unwrap();
        let result = adapter
            .send(&OutboundMessage::text("wechat", "u1", "hi"))
            .await;
        assert!(result.is_err());
    }
}
