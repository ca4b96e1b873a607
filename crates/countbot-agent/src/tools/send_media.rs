//! Tool: send_media — route media files to a chat via the outbound bus.

use std::sync::Arc;

use async_trait::async_trait;

use countbot_bus::MessageBus;
use countbot_core::types::OutboundMessage;

use super::{Tool, ToolResult};

pub struct SendMediaTool {
    bus: Arc<MessageBus>,
}

impl SendMediaTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for SendMediaTool {
    fn name(&self) -> &str {
        "send_media"
    }

    fn description(&self) -> &str {
        "Send one or more media files (images, documents) to a chat on a \
         connected channel."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "channel": {
                    "type": "string",
                    "description": "Target channel name (telegram, feishu, …)."
                },
                "chat_id": {
                    "type": "string",
                    "description": "Target chat id on that channel."
                },
                "paths": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Local file paths of the media to send."
                },
                "caption": {
                    "type": "string",
                    "description": "Optional text to send with the media."
                }
            },
            "required": ["channel", "chat_id", "paths"]
        })
    }

    async fn execute(&self, input: serde_json::Value, _session: Option<&str>) -> ToolResult {
        let Some(channel) = input.get("channel").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: channel");
        };
        let Some(chat_id) = input.get("chat_id").and_then(|v| v.as_str()) else {
            return ToolResult::error("missing required parameter: chat_id");
        };
        let paths: Vec<String> = input
            .get("paths")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if paths.is_empty() {
            return ToolResult::error("paths must be a non-empty array");
        }
        for path in &paths {
            if !std::path::Path::new(path).exists() {
                return ToolResult::error(format!("media file not found: {path}"));
            }
        }

        let caption = input
            .get("caption")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let mut msg = OutboundMessage::text(channel, chat_id, caption);
        msg.media = paths.clone();
        self.bus.publish_outbound(msg);

        ToolResult::success(format!(
            "已发送 {} 个文件到 {channel}:{chat_id}",
            paths.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn publishes_media_on_the_outbound_queue() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("pic.png");
        std::fs::write(&file, b"png").unwrap();

        let bus = Arc::new(MessageBus::new(None, false, 60));
        let tool = SendMediaTool::new(bus.clone());
        let result = tool
            .execute(
                serde_json::json!({
                    "channel": "telegram",
                    "chat_id": "7",
                    "paths": [file.to_string_lossy()],
                }),
                None,
            )
            .await;
        assert!(!result.is_error);

        let out = bus.consume_outbound().await;
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.chat_id, "7");
        assert_eq!(out.media.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_rejected() {
        let bus = Arc::new(MessageBus::new(None, false, 60));
        let tool = SendMediaTool::new(bus);
        let result = tool
            .execute(
                serde_json::json!({
                    "channel": "telegram",
                    "chat_id": "7",
                    "paths": ["/no/such/file.png"],
                }),
                None,
            )
            .await;
        assert!(result.is_error);
    }
}
