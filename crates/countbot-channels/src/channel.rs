//! Common adapter contract.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use countbot_core::types::{InboundMessage, OutboundMessage};

use crate::error::Result;

/// Inbound delivery callback. The handler behind it chooses the queue
/// priority; adapters just hand over normalized messages.
pub type InboundCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Result of probing a channel's credentials/connectivity.
#[derive(Debug, Clone, Serialize)]
pub struct TestConnectionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_info: Option<serde_json::Value>,
}

impl TestConnectionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            bot_info: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            bot_info: None,
        }
    }
}

/// Interface implemented by every transport adapter.
///
/// Implementations must be `Send + Sync`: they are stored in the supervisor
/// and driven from multiple Tokio tasks.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable lowercase identifier (e.g. `"telegram"`). Unique across all
    /// registered adapters — the outbound dispatcher routes on it.
    fn name(&self) -> &str;

    /// Run the receive loop. Returns only when the adapter decides to exit
    /// or the supervisor cancels it; the supervisor restarts it with backoff.
    async fn start(&self) -> Result<()>;

    /// Idempotent shutdown; releases all resources.
    async fn stop(&self);

    /// Deliver one outbound message.
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;

    /// Probe credentials/connectivity without starting the receive loop.
    async fn test_connection(&self) -> TestConnectionResult;

    /// Whitelist check. An empty whitelist allows everyone.
    fn is_allowed(&self, sender_id: &str) -> bool;

    /// Install the inbound callback. Called once before `start`.
    fn set_message_callback(&self, callback: InboundCallback);

    /// Whether the receive loop is currently running.
    fn is_running(&self) -> bool;
}

/// Shared whitelist matcher: empty list allows all; entries match the
/// sender id directly, or any `|`-separated part of a composite id
/// (`"123|alice"` matches an entry of either `123` or `alice`).
pub fn sender_allowed(allow_from: &[String], sender_id: &str) -> bool {
    if allow_from.is_empty() {
        return true;
    }
    if allow_from.iter().any(|entry| entry == sender_id) {
        return true;
    }
    if sender_id.contains('|') {
        return sender_id
            .split('|')
            .filter(|part| !part.is_empty())
            .any(|part| allow_from.iter().any(|entry| entry == part));
    }
    false
}

/// Platform-agnostic message splitter with code-fence awareness.
///
/// When a split lands inside a fenced code block, the fence is closed at the
/// chunk boundary and re-opened (with its language) in the next chunk.
pub fn split_chunks(text: &str, chunk_max: usize) -> Vec<String> {
    if text.len() <= chunk_max {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in text.split('\n') {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };

        if !current.is_empty() && current.len() + cost > chunk_max {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(current);
            current = String::new();
            if let Some(ref lang) = fence_lang {
                current.push_str("```");
                current.push_str(lang);
                current.push('\n');
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let trimmed = line.trim_start();
        if let Some(after) = trimmed.strip_prefix("```") {
            fence_lang = match fence_lang {
                Some(_) => None,
                None => Some(after.trim().to_string()),
            };
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // Force-split any chunk that still exceeds the limit (one huge line).
    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= chunk_max {
            result.push(chunk);
            continue;
        }
        let mut remaining = chunk.as_str();
        while remaining.len() > chunk_max {
            let boundary = floor_char_boundary(remaining, chunk_max);
            let split_at = remaining[..boundary]
                .rfind('\n')
                .or_else(|| remaining[..boundary].rfind(' '))
                .unwrap_or(boundary);
            let split_at = if split_at == 0 { boundary } else { split_at };
            result.push(remaining[..split_at].to_string());
            remaining = remaining[split_at..].trim_start();
        }
        if !remaining.is_empty() {
            result.push(remaining.to_string());
        }
    }
    result
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_whitelist_allows_everyone() {
        assert!(sender_allowed(&[], "anyone"));
    }

    #[test]
    fn direct_id_match() {
        let list = vec!["123".to_string()];
        assert!(sender_allowed(&list, "123"));
        assert!(!sender_allowed(&list, "456"));
    }

    #[test]
    fn composite_id_matches_any_part() {
        let list = vec!["alice".to_string()];
        assert!(sender_allowed(&list, "123|alice"));
        assert!(!sender_allowed(&list, "123|bob"));
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_chunks("hello", 100), vec!["hello"]);
    }

    #[test]
    fn long_text_splits_on_lines_within_limit() {
        let line = "a".repeat(40);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_chunks(&text, 90);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= 90);
        }
    }

    #[test]
    fn code_fence_reopens_with_language() {
        let mut text = String::from("```rust\n");
        for i in 0..40 {
            text.push_str(&format!("let x{i} = {i};\n"));
        }
        text.push_str("```\n");
        let chunks = split_chunks(&text, 200);
        assert!(chunks.len() >= 2);
        assert!(chunks[1].starts_with("```rust"));
        assert!(chunks[0].ends_with("```"));
    }

    #[test]
    fn giant_single_line_is_force_split() {
        let text = "x".repeat(500);
        let chunks = split_chunks(&text, 100);
        assert!(chunks.len() >= 5);
        for c in &chunks {
            assert!(c.len() <= 100);
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "好".repeat(200);
        let chunks = split_chunks(&text, 100);
        for c in &chunks {
            assert!(c.len() <= 100);
            assert!(c.chars().all(|ch| ch == '好'));
        }
    }
}
