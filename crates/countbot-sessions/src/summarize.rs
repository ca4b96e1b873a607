//! Rolling overflow summarization.
//!
//! When a session grows past the history window, the oldest un-summarized
//! messages are folded into the memory file (source `auto-overflow`) via an
//! LLM call, and the session's `last_summarized_msg_id` pointer advances.
//! On LLM failure the pointer stays put so the same messages retry on the
//! next turn.

use std::sync::Arc;

use tracing::{error, info};

use countbot_agent::provider::{chat_collect, text_message, ChatRequest, LlmProvider};
use countbot_memory::MemoryStore;

use crate::error::Result;
use crate::manager::SessionManager;
use crate::types::Message;

const OVERFLOW_SUMMARY_PROMPT: &str = "\
你是记忆整理助手。请将下面这段对话压缩成一条简短的第一人称记忆，\
聚焦事实、决定和用户偏好；多个事项用；分隔；不超过两句话。\
如果对话没有值得记住的内容，只回复“无需记录”。\n\n对话内容：\n{messages}";

/// Per-message content cap in the compact formatter.
const PER_MESSAGE_CHARS: usize = 300;
/// Total budget for the formatted block handed to the LLM.
const FORMAT_MAX_CHARS: usize = 4000;
/// Short acknowledgements at or under this length are skipped.
const ACK_MAX_CHARS: usize = 8;

/// Filler prefixes that make a short message skippable.
const SKIP_PREFIXES: &[&str] = &[
    "好的", "知道了", "明白", "收到", "谢谢", "好", "行", "嗯", "哦", "ok", "OK", "Ok", "嗯嗯",
    "哦哦", "好好", "了解", "可以", "没问题", "对", "是的", "没错", "确实", "哈哈", "呵呵",
    "嘻嘻", "666", "👍", "🙏", "感谢", "thanks", "thx", "yes", "no", "yep", "nope", "sure",
    "got it", "noted", "fine", "cool", "nice",
];

/// Compact `ROLE: content` rendering of messages for the summary prompt.
///
/// Skips empty messages and trivial acknowledgements, truncates long content
/// per message, and stops once the total budget is spent.
pub fn format_messages_for_summary(messages: &[(String, String)], max_chars: usize) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut total = 0usize;

    for (role, content) in messages {
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let char_count = content.chars().count();
        if char_count <= ACK_MAX_CHARS && SKIP_PREFIXES.iter().any(|p| content.starts_with(p)) {
            continue;
        }

        let content = if char_count > PER_MESSAGE_CHARS {
            let clipped: String = content.chars().take(PER_MESSAGE_CHARS).collect();
            format!("{clipped}...")
        } else {
            content.to_string()
        };

        let line = format!("{}: {}", role.to_uppercase(), content);
        let line_len = line.chars().count();
        if total + line_len + 1 > max_chars {
            break;
        }
        total += line_len + 1;
        lines.push(line);
    }

    lines.join("\n")
}

impl SessionManager {
    /// Fold history beyond `max_history` into the memory file.
    ///
    /// Algorithm:
    /// 1. No overflow (`total <= max_history`) → return.
    /// 2. Select messages with `id > last_summarized_msg_id`, oldest first,
    ///    limited to the overflow count.
    /// 3. Fewer than 3 summarizable user/assistant messages → advance the
    ///    pointer to the selection tail and return (not worth an LLM call).
    /// 4. Otherwise summarize via the LLM, append to memory with source
    ///    `auto-overflow`, and advance the pointer.
    ///
    /// LLM failure is logged and leaves the pointer unchanged.
    pub async fn summarize_overflow(
        &self,
        session_id: &str,
        max_history: usize,
        provider: &dyn LlmProvider,
        model: &str,
        memory: &Arc<MemoryStore>,
    ) -> Result<()> {
        if max_history == 0 {
            return Ok(());
        }

        let total = self.message_count(session_id)? as usize;
        if total <= max_history {
            return Ok(());
        }
        let overflow_count = total - max_history;

        let Some(session) = self.get_session(session_id)? else {
            return Ok(());
        };

        let overflow: Vec<Message> =
            self.messages_after(session_id, session.last_summarized_msg_id, overflow_count)?;
        let Some(tail) = overflow.last() else {
            return Ok(());
        };
        let tail_id = tail.id;

        let summarizable: Vec<(String, String)> = overflow
            .iter()
            .filter(|m| (m.role == "user" || m.role == "assistant") && !m.content.is_empty())
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect();

        if summarizable.len() < 3 {
            self.set_last_summarized(session_id, tail_id)?;
            return Ok(());
        }

        let formatted = format_messages_for_summary(&summarizable, FORMAT_MAX_CHARS);
        let prompt = OVERFLOW_SUMMARY_PROMPT.replace("{messages}", &formatted);

        let mut request = ChatRequest::new(model, vec![text_message("user", &prompt)]);
        request.temperature = 0.3;

        match chat_collect(provider, request).await {
            Ok(summary) => {
                if !summary.is_empty() && !summary.contains("无需记录") {
                    if let Err(e) = memory.append("auto-overflow", &summary) {
                        error!(session = session_id, "failed to write overflow memory: {e}");
                        return Ok(());
                    }
                    info!(
                        session = session_id,
                        messages = overflow.len(),
                        "overflow summary saved to memory"
                    );
                }
                self.set_last_summarized(session_id, tail_id)?;
            }
            Err(e) => {
                // Pointer stays put so these messages retry next turn.
                error!(session = session_id, "overflow summarize failed: {e}");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use countbot_agent::provider::StreamChunk;
    use rusqlite::Connection;
    use tokio::sync::mpsc;

    struct FixedProvider {
        reply: Option<String>,
    }

    #[async_trait]
    impl LlmProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> mpsc::Receiver<StreamChunk> {
            let (tx, rx) = mpsc::channel(4);
            let reply = self.reply.clone();
            tokio::spawn(async move {
                match reply {
                    Some(text) => {
                        let _ = tx.send(StreamChunk::Content(text)).await;
                        let _ = tx
                            .send(StreamChunk::Finish {
                                reason: "stop".into(),
                                usage: None,
                            })
                            .await;
                    }
                    None => {
                        let _ = tx
                            .send(StreamChunk::Error("网络连接异常，请检查网络设置后重试。".into()))
                            .await;
                    }
                }
            });
            rx
        }
    }

    fn setup() -> (SessionManager, tempfile::TempDir, Arc<MemoryStore>) {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::new(dir.path()).unwrap());
        (SessionManager::new(conn), dir, memory)
    }

    #[test]
    fn formatter_skips_acks_and_truncates() {
        let messages = vec![
            ("user".to_string(), "好的".to_string()),
            ("user".to_string(), "ok".to_string()),
            ("user".to_string(), "我想订一张去上海的机票".to_string()),
            ("assistant".to_string(), "х".repeat(400)),
        ];
        let out = format_messages_for_summary(&messages, 4000);
        assert!(!out.contains("好的"));
        assert!(out.contains("USER: 我想订一张去上海的机票"));
        assert!(out.contains("..."));
    }

    #[test]
    fn formatter_respects_total_budget() {
        let messages: Vec<(String, String)> = (0..100)
            .map(|i| ("user".to_string(), format!("message number {i} with some length")))
            .collect();
        let out = format_messages_for_summary(&messages, 200);
        assert!(out.chars().count() <= 200);
    }

    #[tokio::test]
    async fn overflow_summarizes_and_advances_pointer() {
        let (m, _dir, memory) = setup();
        let s = m.create_session("s").unwrap();
        let mut ids = Vec::new();
        for i in 0..25 {
            ids.push(
                m.add_message(&s.id, if i % 2 == 0 { "user" } else { "assistant" },
                    &format!("planning the trip, step {i}"))
                    .unwrap()
                    .id,
            );
        }

        let provider = FixedProvider {
            reply: Some("user planned a trip".into()),
        };
        m.summarize_overflow(&s.id, 10, &provider, "test-model", &memory)
            .await
            .unwrap();

        // 25 messages, window 10: the first 15 are summarized.
        let session = m.get_session(&s.id).unwrap().unwrap();
        assert_eq!(session.last_summarized_msg_id, ids[14]);

        let text = memory.read_lines(1, None).unwrap();
        assert!(text.contains("auto-overflow"));
        assert!(text.contains("user planned a trip"));

        // Second call with no new messages is a no-op.
        m.summarize_overflow(&s.id, 10, &provider, "test-model", &memory)
            .await
            .unwrap();
        assert_eq!(memory.line_count().unwrap(), 1);
        let session = m.get_session(&s.id).unwrap().unwrap();
        assert_eq!(session.last_summarized_msg_id, ids[14]);
    }

    #[tokio::test]
    async fn no_overflow_means_no_work() {
        let (m, _dir, memory) = setup();
        let s = m.create_session("s").unwrap();
        for i in 0..5 {
            m.add_message(&s.id, "user", &format!("m{i}")).unwrap();
        }
        let provider = FixedProvider {
            reply: Some("should not be called".into()),
        };
        m.summarize_overflow(&s.id, 10, &provider, "m", &memory)
            .await
            .unwrap();
        assert_eq!(memory.line_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn too_few_summarizable_messages_only_advances_pointer() {
        let (m, _dir, memory) = setup();
        let s = m.create_session("s").unwrap();
        // Overflow consists mostly of tool messages, under the threshold of 3.
        let mut last_id = 0;
        for i in 0..12 {
            let role = if i < 10 { "tool" } else { "user" };
            last_id = m
                .add_message(&s.id, role, &format!("m{i}"))
                .unwrap()
                .id;
        }
        let _ = last_id;
        let provider = FixedProvider {
            reply: Some("should not be called".into()),
        };
        // Window 2: overflow is the first 10 (all tool messages).
        m.summarize_overflow(&s.id, 2, &provider, "m", &memory)
            .await
            .unwrap();
        assert_eq!(memory.line_count().unwrap(), 0);
        let session = m.get_session(&s.id).unwrap().unwrap();
        assert!(session.last_summarized_msg_id > 0);
    }

    #[tokio::test]
    async fn llm_failure_does_not_advance_pointer() {
        let (m, _dir, memory) = setup();
        let s = m.create_session("s").unwrap();
        for i in 0..25 {
            m.add_message(&s.id, "user", &format!("important detail {i}"))
                .unwrap();
        }
        let provider = FixedProvider { reply: None };
        m.summarize_overflow(&s.id, 10, &provider, "m", &memory)
            .await
            .unwrap();
        let session = m.get_session(&s.id).unwrap().unwrap();
        assert_eq!(session.last_summarized_msg_id, 0);
        assert_eq!(memory.line_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn nothing_to_record_reply_advances_without_memory_write() {
        let (m, _dir, memory) = setup();
        let s = m.create_session("s").unwrap();
        for i in 0..25 {
            m.add_message(&s.id, "user", &format!("small talk {i}"))
                .unwrap();
        }
        let provider = FixedProvider {
            reply: Some("无需记录".into()),
        };
        m.summarize_overflow(&s.id, 10, &provider, "m", &memory)
            .await
            .unwrap();
        let session = m.get_session(&s.id).unwrap().unwrap();
        assert!(session.last_summarized_msg_id > 0);
        assert_eq!(memory.line_count().unwrap(), 0);
    }
}
