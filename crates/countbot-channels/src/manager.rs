//! Channel supervision and outbound routing.
//!
//! Each adapter runs under an independent restart loop: when `start()`
//! returns or errors, the supervisor waits an exponential backoff
//! (5 s → 10 s → … capped at 300 s) and restarts it. An adapter that stayed
//! up longer than 60 s before exiting resets the backoff. A single outbound
//! dispatcher consumes the bus's outbound queue and routes by channel name;
//! unknown names are logged and dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use countbot_bus::MessageBus;

use crate::channel::{Channel, TestConnectionResult};

const BACKOFF_BASE_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 300;
/// Uptime after which the backoff resets to the base.
const HEALTHY_RUN_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub enabled: bool,
    pub running: bool,
    pub display_name: String,
}

pub struct ChannelSupervisor {
    channels: HashMap<String, Arc<dyn Channel>>,
    bus: Arc<MessageBus>,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl ChannelSupervisor {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            channels: HashMap::new(),
            bus,
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register an adapter. Same-named registrations replace each other.
    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!(channel = %name, "registering channel adapter");
        self.channels.insert(name, channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start every adapter under supervision plus the outbound dispatcher.
    /// Returns immediately.
    pub fn start_all(self: &Arc<Self>) {
        if self.channels.is_empty() {
            warn!("no channels to start");
        }
        self.running.store(true, Ordering::Relaxed);

        {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move { supervisor.dispatch_outbound().await });
        }

        for (name, channel) in &self.channels {
            let supervisor = Arc::clone(self);
            let name = name.clone();
            let channel = Arc::clone(channel);
            tokio::spawn(async move { supervisor.supervise(name, channel).await });
        }
    }

    /// Cancel all adapters and invoke their `stop()`.
    pub async fn stop_all(&self) {
        info!("stopping all channels");
        self.running.store(false, Ordering::Relaxed);
        self.shutdown.cancel();
        for (name, channel) in &self.channels {
            channel.stop().await;
            info!(channel = %name, "channel stopped");
        }
    }

    async fn supervise(&self, name: String, channel: Arc<dyn Channel>) {
        let mut backoff = BACKOFF_BASE_SECS;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            info!(channel = %name, "starting channel");
            let started = Instant::now();

            tokio::select! {
                result = channel.start() => {
                    match result {
                        Ok(()) => warn!(channel = %name, "channel exited"),
                        Err(e) => error!(channel = %name, error = %e, "channel failed"),
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            if started.elapsed() > Duration::from_secs(HEALTHY_RUN_SECS) {
                backoff = BACKOFF_BASE_SECS;
            }

            warn!(channel = %name, backoff_secs = backoff, "restarting channel after backoff");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                _ = self.shutdown.cancelled() => break,
            }
            backoff = (backoff * 2).min(BACKOFF_MAX_SECS);
        }
    }

    /// The single outbound dispatcher: publish order per chat is preserved
    /// because this is the only consumer of the outbound queue.
    async fn dispatch_outbound(&self) {
        info!("outbound dispatcher started");
        loop {
            let msg = tokio::select! {
                msg = self.bus.consume_outbound() => msg,
                _ = self.shutdown.cancelled() => break,
            };

            match self.channels.get(&msg.channel) {
                Some(channel) => {
                    if let Err(e) = channel.send(&msg).await {
                        error!(
                            channel = %msg.channel,
                            chat = %msg.chat_id,
                            error = %e,
                            "outbound send failed"
                        );
                    }
                }
                None => warn!(channel = %msg.channel, "unknown outbound channel, dropping"),
            }
        }
        info!("outbound dispatcher stopped");
    }

    pub fn statuses(&self) -> HashMap<String, ChannelStatus> {
        self.channels
            .iter()
            .map(|(name, channel)| {
                (
                    name.clone(),
                    ChannelStatus {
                        enabled: true,
                        running: channel.is_running(),
                        display_name: capitalize(name),
                    },
                )
            })
            .collect()
    }

    pub async fn test_channel(&self, name: &str) -> TestConnectionResult {
        match self.channels.get(name) {
            Some(channel) => channel.test_connection().await,
            None => TestConnectionResult::fail(format!("Unknown channel: {name}")),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().to_string() + chars.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InboundCallback;
    use async_trait::async_trait;
    use countbot_core::types::OutboundMessage;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct RecordingChannel {
        name: String,
        sent: Mutex<Vec<OutboundMessage>>,
        starts: AtomicUsize,
        exit_quickly: bool,
    }

    impl RecordingChannel {
        fn new(name: &str, exit_quickly: bool) -> Self {
            Self {
                name: name.to_string(),
                sent: Mutex::new(Vec::new()),
                starts: AtomicUsize::new(0),
                exit_quickly,
            }
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            &self.name
        }
        async fn start(&self) -> crate::error::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.exit_quickly {
                Ok(())
            } else {
                // Simulate a healthy long-running loop.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
        async fn stop(&self) {}
        async fn send(&self, msg: &OutboundMessage) -> crate::error::Result<()> {
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }
        async fn test_connection(&self) -> TestConnectionResult {
            TestConnectionResult::ok("ok")
        }
        fn is_allowed(&self, _sender: &str) -> bool {
            true
        }
        fn set_message_callback(&self, _cb: InboundCallback) {}
        fn is_running(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn outbound_routes_to_the_named_adapter() {
        let bus = Arc::new(MessageBus::new(None, false, 60));
        let telegram = Arc::new(RecordingChannel::new("telegram", false));
        let discord = Arc::new(RecordingChannel::new("discord", false));

        let mut supervisor = ChannelSupervisor::new(bus.clone());
        supervisor.register(telegram.clone());
        supervisor.register(discord.clone());
        let supervisor = Arc::new(supervisor);
        supervisor.start_all();

        bus.publish_outbound(OutboundMessage::text("telegram", "7", "hi"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(telegram.sent.lock().unwrap().len(), 1);
        assert!(discord.sent.lock().unwrap().is_empty());
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn unknown_channel_is_dropped_without_crashing() {
        let bus = Arc::new(MessageBus::new(None, false, 60));
        let telegram = Arc::new(RecordingChannel::new("telegram", false));
        let mut supervisor = ChannelSupervisor::new(bus.clone());
        supervisor.register(telegram.clone());
        let supervisor = Arc::new(supervisor);
        supervisor.start_all();

        bus.publish_outbound(OutboundMessage::text("ghost", "7", "hi"));
        bus.publish_outbound(OutboundMessage::text("telegram", "7", "second"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The dispatcher survived the unknown channel and delivered the next.
        assert_eq!(telegram.sent.lock().unwrap().len(), 1);
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn outbound_order_is_preserved_per_chat() {
        let bus = Arc::new(MessageBus::new(None, false, 60));
        let telegram = Arc::new(RecordingChannel::new("telegram", false));
        let mut supervisor = ChannelSupervisor::new(bus.clone());
        supervisor.register(telegram.clone());
        let supervisor = Arc::new(supervisor);
        supervisor.start_all();

        for i in 0..5 {
            bus.publish_outbound(OutboundMessage::text("telegram", "7", format!("m{i}")));
        }
        tokio::time::sleep(Duration::from_millis(150)).await;

        let sent = telegram.sent.lock().unwrap();
        let contents: Vec<&str> = sent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
        supervisor.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_adapter_is_restarted_with_backoff() {
        let bus = Arc::new(MessageBus::new(None, false, 60));
        let flaky = Arc::new(RecordingChannel::new("qq", true));
        let mut supervisor = ChannelSupervisor::new(bus);
        supervisor.register(flaky.clone());
        let supervisor = Arc::new(supervisor);
        supervisor.start_all();

        // First start happens immediately; restarts follow 5 s, then 10 s.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(flaky.starts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(flaky.starts.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(flaky.starts.load(Ordering::SeqCst), 3);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_channel_reports_unknown_names() {
        let bus = Arc::new(MessageBus::new(None, false, 60));
        let supervisor = ChannelSupervisor::new(bus);
        let result = supervisor.test_channel("nope").await;
        assert!(!result.success);
        assert!(result.message.contains("Unknown channel"));
    }
}
