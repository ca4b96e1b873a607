use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message received from an external channel (Telegram, QQ, DingTalk, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Logical channel name (e.g. "telegram", "feishu").
    pub channel: String,

    /// Platform-native identifier for the sender.
    pub sender_id: String,

    /// Platform-native identifier for the conversation (group or DM).
    pub chat_id: String,

    /// Plain text content of the message.
    pub content: String,

    /// Local paths or URLs of attached media, if any.
    #[serde(default)]
    pub media: Vec<String>,

    /// Free-form platform extras (message ids, reply windows, …).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A message to be delivered to an external channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Logical channel name the supervisor routes this to.
    pub channel: String,

    /// Platform-native identifier for the recipient conversation.
    pub chat_id: String,

    /// Content to deliver.
    pub content: String,

    /// Local paths or URLs of media to attach, if any.
    #[serde(default)]
    pub media: Vec<String>,

    /// Free-form platform extras.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutboundMessage {
    pub fn text(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Inbound queue priority. Higher value dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl MessagePriority {
    /// All priorities in strict dequeue order (URGENT first).
    pub const ORDERED: [MessagePriority; 4] = [
        MessagePriority::Urgent,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    /// One step lower, saturating at LOW. Used when a failed message is
    /// re-enqueued.
    pub fn demoted(self) -> Self {
        match self {
            MessagePriority::Urgent => MessagePriority::High,
            MessagePriority::High => MessagePriority::Normal,
            MessagePriority::Normal | MessagePriority::Low => MessagePriority::Low,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            MessagePriority::Low => "LOW",
            MessagePriority::Normal => "NORMAL",
            MessagePriority::High => "HIGH",
            MessagePriority::Urgent => "URGENT",
        }
    }
}

/// An inbound message wrapped with its queue metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Queue-assigned UUID, also the persistence file stem.
    pub id: String,
    pub message: InboundMessage,
    pub priority: MessagePriority,
    /// Unix timestamp (seconds) at enqueue time.
    pub timestamp: f64,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueuedMessage {
    pub fn new(message: InboundMessage, priority: MessagePriority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message,
            priority,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            retry_count: 0,
            max_retries: 3,
        }
    }
}
