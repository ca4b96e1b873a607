//! Ingress-to-agent glue for all transport traffic.
//!
//! Consumes the bus's inbound queue, handles slash commands inline, and
//! drives the agent loop for everything else. Turns for the same session are
//! serialized; different sessions run in parallel.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use countbot_agent::agent_loop::{AgentLoop, STOPPED_MARKER};
use countbot_bus::{MessageBus, RateLimiter};
use countbot_core::types::{InboundMessage, MessagePriority, OutboundMessage, QueuedMessage};
use countbot_memory::MemoryStore;
use countbot_sessions::SessionManager;

use crate::channel::InboundCallback;

const HELP_TEXT: &str = "可用命令:\n\
    /new - 新建会话\n\
    /list - 列出最近会话\n\
    /switch <id> - 切换会话\n\
    /clear - 清空当前会话\n\
    /stop - 停止当前任务\n\
    /help - 显示本帮助";

/// Map a raw exception onto the short user-facing vocabulary.
pub fn friendly_channel_error(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let any = |keys: &[&str]| keys.iter().any(|k| lower.contains(k) || raw.contains(k));

    if any(&["429", "余额", "quota", "rate limit", "资源包", "充值", "balance"]) {
        return "AI 服务额度不足，请联系管理员检查 API 账户余额。".to_string();
    }
    if any(&["401", "unauthorized", "api key", "authentication"]) {
        return "API 认证失败，请联系管理员检查密钥配置。".to_string();
    }
    if any(&["context length", "too long", "context_length_exceeded"]) {
        return "对话上下文过长，请发送 /new 创建新会话后重试。".to_string();
    }
    if any(&["500", "502", "503", "504", "service unavailable"]) {
        return "AI 服务暂时不可用，请稍后重试。".to_string();
    }
    if any(&["timeout", "connection", "network", "ssl"]) {
        return "网络连接异常，请稍后重试。".to_string();
    }
    "处理消息时出错，请稍后重试。".to_string()
}

/// Remove `@_user_<digits>` mention tokens anywhere in the text.
pub fn strip_mentions(text: &str) -> String {
    const PREFIX: &str = "@_user_";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(PREFIX) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + PREFIX.len()..];
        let digits = after.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            // Not a mention token after all; keep the literal text.
            out.push_str(PREFIX);
            rest = after;
            continue;
        }
        let after_digits = &after[digits..];
        rest = after_digits.trim_start_matches(' ');
    }
    out.push_str(rest);
    out.trim().to_string()
}

pub struct ChannelMessageHandler {
    bus: Arc<MessageBus>,
    rate_limiter: Option<Arc<RateLimiter>>,
    sessions: Arc<SessionManager>,
    memory: Arc<MemoryStore>,
    agent: Arc<AgentLoop>,
    /// -1 means unlimited history.
    max_history: RwLock<i64>,
    /// session_id -> cancel token for the in-flight turn.
    active_tasks: DashMap<String, CancellationToken>,
    /// "{channel}:{chat_id}" -> explicitly selected session id (/new, /switch).
    active_sessions: DashMap<String, String>,
    /// session_id -> serialization lock so one session runs one turn at a time.
    session_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ChannelMessageHandler {
    pub fn new(
        bus: Arc<MessageBus>,
        rate_limiter: Option<Arc<RateLimiter>>,
        sessions: Arc<SessionManager>,
        memory: Arc<MemoryStore>,
        agent: Arc<AgentLoop>,
        max_history: i64,
    ) -> Self {
        Self {
            bus,
            rate_limiter,
            sessions,
            memory,
            agent,
            max_history: RwLock::new(max_history),
            active_tasks: DashMap::new(),
            active_sessions: DashMap::new(),
            session_locks: DashMap::new(),
        }
    }

    /// Hot-reload the history window after a settings change.
    pub fn set_max_history(&self, max_history: i64) {
        *self.max_history.write().unwrap() = max_history;
    }

    pub fn agent(&self) -> &Arc<AgentLoop> {
        &self.agent
    }

    /// The callback adapters invoke for each normalized inbound message.
    /// Commands jump the queue; ordinary chat rides NORMAL.
    pub fn inbound_callback(self: &Arc<Self>) -> InboundCallback {
        let handler = Arc::clone(self);
        Arc::new(move |msg: InboundMessage| {
            let priority = if msg.content.trim_start().starts_with('/') {
                MessagePriority::High
            } else {
                MessagePriority::Normal
            };
            handler.bus.enqueue(msg, priority);
        })
    }

    /// Consume the inbound queue forever, handling each message in its own
    /// task. The bus is told about success/failure for retry accounting.
    pub async fn start_processing(self: Arc<Self>) {
        info!("message processing loop started");
        loop {
            let queued = self.bus.dequeue().await;
            debug!(
                channel = %queued.message.channel,
                queue_depth = self.bus.inbound_size(),
                "inbound message consumed"
            );
            let handler = Arc::clone(&self);
            tokio::spawn(async move {
                handler.handle_queued(queued).await;
            });
        }
    }

    async fn handle_queued(&self, queued: QueuedMessage) {
        match self.handle_message(&queued.message).await {
            Ok(()) => self.bus.mark_success(&queued),
            Err(e) => {
                error!(channel = %queued.message.channel, error = %e, "message handling failed");
                self.reply(&queued.message, &friendly_channel_error(&e));
                self.bus.mark_failed(queued, &e);
            }
        }
    }

    /// Process one inbound message end to end.
    pub async fn handle_message(&self, msg: &InboundMessage) -> Result<(), String> {
        let content = strip_mentions(&msg.content);
        info!(
            channel = %msg.channel,
            sender = %msg.sender_id,
            chat = %msg.chat_id,
            preview = %content.chars().take(50).collect::<String>(),
            "handling inbound message"
        );

        if let Some(ref limiter) = self.rate_limiter {
            let (allowed, deny_message) = limiter.check(&msg.sender_id);
            if !allowed {
                warn!(sender = %msg.sender_id, "rate limited");
                self.reply(msg, &deny_message.unwrap_or_default());
                return Ok(());
            }
        }

        let command = content.to_lowercase();
        match command.as_str() {
            "/new" | "/newsession" | "/new_session" => return self.cmd_new_session(msg),
            "/list" | "/sessions" | "/list_sessions" => return self.cmd_list_sessions(msg),
            "/clear" | "/clear_history" => return self.cmd_clear_history(msg),
            "/stop" | "/cancel" => return self.cmd_stop(msg),
            "/help" | "/h" | "/?" => {
                self.reply(msg, HELP_TEXT);
                return Ok(());
            }
            _ => {}
        }
        if command.starts_with("/switch ") || command.starts_with("/切换 ") {
            return self.cmd_switch_session(msg, &content);
        }

        self.run_agent_turn(msg, &content).await
    }

    // -----------------------------------------------------------------------
    // Agent turn
    // -----------------------------------------------------------------------

    async fn run_agent_turn(&self, msg: &InboundMessage, content: &str) -> Result<(), String> {
        let session_id = self.resolve_session(msg).map_err(|e| e.to_string())?;

        // One turn per session at a time; later messages queue behind this
        // lock in arrival order.
        let lock = self
            .session_locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _turn_guard = lock.lock().await;

        let cancel = CancellationToken::new();
        self.active_tasks.insert(session_id.clone(), cancel.clone());

        let result = self
            .run_agent_turn_locked(msg, content, &session_id, cancel)
            .await;

        self.active_tasks.remove(&session_id);
        result
    }

    async fn run_agent_turn_locked(
        &self,
        msg: &InboundMessage,
        content: &str,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), String> {
        let max_history = *self.max_history.read().unwrap();

        // Fold overflow into memory before loading the window.
        if max_history > 0 {
            let provider = self.agent.provider();
            let model = self.agent.params().model;
            if let Err(e) = self
                .sessions
                .summarize_overflow(
                    session_id,
                    max_history as usize,
                    provider.as_ref(),
                    &model,
                    &self.memory,
                )
                .await
            {
                warn!(session = session_id, "overflow summarization failed: {e}");
            }
        }

        self.sessions
            .add_message(session_id, "user", &msg.content)
            .map_err(|e| e.to_string())?;

        let limit = if max_history < 0 {
            None
        } else {
            Some(max_history as usize)
        };
        let mut history: Vec<serde_json::Value> = self
            .sessions
            .get_messages(session_id, limit, 0)
            .map_err(|e| e.to_string())?
            .iter()
            .map(|m| m.to_context_value())
            .collect();
        // Exclude the turn just saved; it goes in as the user message.
        history.pop();

        debug!(
            session = session_id,
            history_len = history.len(),
            "starting agent turn"
        );

        let mut stream = self.agent.process_message(
            content.to_string(),
            session_id.to_string(),
            history,
            msg.media.clone(),
            cancel.clone(),
        );

        let mut parts = String::new();
        while let Some(chunk) = stream.next().await {
            parts.push_str(&chunk);
        }

        if cancel.is_cancelled() || parts == STOPPED_MARKER {
            info!(session = session_id, "turn cancelled");
            self.reply(msg, "任务已取消");
            return Ok(());
        }

        let response = parts.trim().to_string();
        if response.is_empty() {
            warn!(session = session_id, "agent produced no response");
            self.reply(msg, "抱歉，未能生成回复，请稍后重试。");
            return Ok(());
        }

        self.sessions
            .add_message(session_id, "assistant", &response)
            .map_err(|e| e.to_string())?;
        self.reply(msg, &response);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Session commands
    // -----------------------------------------------------------------------

    fn chat_key(msg: &InboundMessage) -> String {
        format!("{}:{}", msg.channel, msg.chat_id)
    }

    fn resolve_session(&self, msg: &InboundMessage) -> countbot_sessions::Result<String> {
        if let Some(id) = msg
            .metadata
            .get("session_id")
            .and_then(|v| v.as_str())
        {
            return Ok(id.to_string());
        }

        let chat_key = Self::chat_key(msg);
        if let Some(active) = self.active_sessions.get(&chat_key) {
            return Ok(active.clone());
        }

        if let Some(session) = self.sessions.find_by_name(&chat_key)? {
            return Ok(session.id);
        }
        Ok(self.sessions.create_session(&chat_key)?.id)
    }

    fn cmd_new_session(&self, msg: &InboundMessage) -> Result<(), String> {
        let name = format!(
            "{}:{}:{}",
            msg.channel,
            msg.chat_id,
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let session = self.sessions.create_session(&name).map_err(|e| e.to_string())?;
        self.active_sessions
            .insert(Self::chat_key(msg), session.id.clone());
        self.reply(
            msg,
            &format!("新会话已创建: {}\n名称: {}", session.id, session.name),
        );
        Ok(())
    }

    fn cmd_list_sessions(&self, msg: &InboundMessage) -> Result<(), String> {
        let prefix = Self::chat_key(msg);
        let sessions = self
            .sessions
            .list_by_name_prefix(&prefix, 10)
            .map_err(|e| e.to_string())?;

        if sessions.is_empty() {
            self.reply(msg, "暂无会话记录。");
            return Ok(());
        }

        let mut lines = vec!["最近会话（最多 10 条）:".to_string()];
        for (i, session) in sessions.iter().enumerate() {
            let count = self
                .sessions
                .message_count(&session.id)
                .unwrap_or_default();
            lines.push(format!(
                "{}. {}\n   ID: {}\n   消息数: {}",
                i + 1,
                session.name,
                session.id,
                count
            ));
        }
        lines.push("\n使用 /switch <session_id> 切换会话。".to_string());
        self.reply(msg, &lines.join("\n"));
        Ok(())
    }

    fn cmd_switch_session(&self, msg: &InboundMessage, content: &str) -> Result<(), String> {
        let Some(session_id) = content.split_whitespace().nth(1) else {
            self.reply(msg, "用法: /switch <session_id>");
            return Ok(());
        };

        match self.sessions.get_session(session_id) {
            Ok(Some(session)) => {
                self.active_sessions
                    .insert(Self::chat_key(msg), session.id.clone());
                self.reply(msg, &format!("已切换到会话: {}", session.name));
            }
            Ok(None) => self.reply(msg, &format!("会话 {session_id} 不存在。")),
            Err(e) => return Err(e.to_string()),
        }
        Ok(())
    }

    fn cmd_clear_history(&self, msg: &InboundMessage) -> Result<(), String> {
        let session_id = self.resolve_session(msg).map_err(|e| e.to_string())?;
        self.sessions
            .clear_messages(&session_id)
            .map_err(|e| e.to_string())?;
        self.reply(msg, "历史已清空。");
        Ok(())
    }

    fn cmd_stop(&self, msg: &InboundMessage) -> Result<(), String> {
        let session_id = self.resolve_session(msg).map_err(|e| e.to_string())?;
        if self.cancel_task(&session_id) {
            self.reply(msg, "任务已停止。");
        } else {
            self.reply(msg, "当前没有正在执行的任务。");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task management
    // -----------------------------------------------------------------------

    /// Register a cancel token for an externally driven turn (WebSocket
    /// chat) so /stop and the REST cancel endpoint reach it too.
    pub fn register_cancel(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.active_tasks.insert(session_id.to_string(), token.clone());
        token
    }

    pub fn unregister_cancel(&self, session_id: &str) {
        self.active_tasks.remove(session_id);
    }

    /// Serialization lock for a session; WebSocket turns share it with
    /// channel turns so a session never runs two turns at once.
    pub fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Cancel the in-flight turn for a session. Used by /stop and the REST
    /// cancel endpoint.
    pub fn cancel_task(&self, session_id: &str) -> bool {
        match self.active_tasks.get(session_id) {
            Some(token) => {
                token.cancel();
                info!(session = session_id, "task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn active_task_sessions(&self) -> Vec<String> {
        self.active_tasks.iter().map(|e| e.key().clone()).collect()
    }

    pub fn queue_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "inbound_size": self.bus.inbound_size(),
            "outbound_size": self.bus.outbound_size(),
            "active_tasks": self.active_tasks.len(),
            "rate_limiter": self.rate_limiter.as_ref().map(|l| l.stats()),
        })
    }

    fn reply(&self, original: &InboundMessage, content: &str) {
        self.bus.publish_outbound(OutboundMessage::text(
            &original.channel,
            &original.chat_id,
            content,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use countbot_agent::agent_loop::LoopParams;
    use countbot_agent::prompt::ContextBuilder;
    use countbot_agent::provider::{ChatRequest, LlmProvider, StreamChunk};
    use countbot_agent::tools::ToolRegistry;
    use tokio::sync::mpsc;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        async fn chat_stream(&self, req: ChatRequest) -> mpsc::Receiver<StreamChunk> {
            let (tx, rx) = mpsc::channel(4);
            // Echo the last user message back with a prefix.
            let last = req
                .messages
                .last()
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            tokio::spawn(async move {
                let _ = tx.send(StreamChunk::Content(format!("echo: {last}"))).await;
                let _ = tx
                    .send(StreamChunk::Finish {
                        reason: "stop".into(),
                        usage: None,
                    })
                    .await;
            });
            rx
        }
    }

    fn handler() -> (Arc<ChannelMessageHandler>, Arc<MessageBus>, Arc<SessionManager>) {
        let dir = tempfile::TempDir::new().unwrap();
        let memory =
            Arc::new(MemoryStore::new(&dir.path().join("memory")).unwrap());
        let context = Arc::new(ContextBuilder::new(
            countbot_core::config::PersonaConfig::default(),
            memory.clone(),
            dir.path().to_path_buf(),
        ));
        std::mem::forget(dir);
        let agent = Arc::new(AgentLoop::new(
            Arc::new(EchoProvider),
            ToolRegistry::new(),
            context,
            LoopParams {
                model: "m".into(),
                temperature: 0.7,
                max_tokens: 256,
                max_iterations: 5,
            },
        ));
        let bus = Arc::new(MessageBus::new(None, false, 60));
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        countbot_sessions::db::init_db(&conn).unwrap();
        let sessions = Arc::new(SessionManager::new(conn));
        let handler = Arc::new(ChannelMessageHandler::new(
            bus.clone(),
            None,
            sessions.clone(),
            memory,
            agent,
            50,
        ));
        (handler, bus, sessions)
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage::new("telegram", "9", "7", content)
    }

    #[test]
    fn mention_stripping_removes_user_tokens() {
        assert_eq!(strip_mentions("@_user_123 hello"), "hello");
        assert_eq!(strip_mentions("hi @_user_42 there"), "hi there");
        assert_eq!(strip_mentions("no mentions"), "no mentions");
        assert_eq!(strip_mentions("@_user_abc not a mention"), "@_user_abc not a mention");
    }

    #[test]
    fn friendly_errors_cover_the_vocabulary() {
        assert!(friendly_channel_error("429 too many requests").contains("额度"));
        assert!(friendly_channel_error("401 unauthorized").contains("认证失败"));
        assert!(friendly_channel_error("context length exceeded").contains("/new"));
        assert!(friendly_channel_error("503 service unavailable").contains("暂时不可用"));
        assert!(friendly_channel_error("connection reset").contains("网络"));
        assert!(friendly_channel_error("mystery").contains("稍后重试"));
    }

    #[tokio::test]
    async fn ordinary_message_runs_a_turn_and_replies() {
        let (handler, bus, sessions) = handler();
        handler.handle_message(&inbound("ping")).await.unwrap();

        let out = bus.consume_outbound().await;
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.chat_id, "7");
        assert!(out.content.starts_with("echo:"));

        // user + assistant persisted in the chat session.
        let session = sessions.find_by_name("telegram:7").unwrap().unwrap();
        let msgs = sessions.get_messages(&session.id, None, 0).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[0].content, "ping");
        assert_eq!(msgs[1].role, "assistant");
    }

    #[tokio::test]
    async fn help_command_short_circuits() {
        let (handler, bus, sessions) = handler();
        handler.handle_message(&inbound("/help")).await.unwrap();
        let out = bus.consume_outbound().await;
        assert!(out.content.contains("/switch"));
        // No session writes for commands.
        assert!(sessions.find_by_name("telegram:7").unwrap().is_none());
    }

    #[tokio::test]
    async fn new_session_command_switches_the_active_session() {
        let (handler, bus, sessions) = handler();
        handler.handle_message(&inbound("/new")).await.unwrap();
        let ack = bus.consume_outbound().await;
        assert!(ack.content.contains("新会话已创建"));

        // Subsequent messages land in the newly created session.
        handler.handle_message(&inbound("hello")).await.unwrap();
        let _reply = bus.consume_outbound().await;
        let sessions_list = sessions.list_by_name_prefix("telegram:7", 10).unwrap();
        let timestamped = sessions_list
            .iter()
            .find(|s| s.name.len() > "telegram:7".len())
            .unwrap();
        assert_eq!(sessions.message_count(&timestamped.id).unwrap(), 2);
    }

    #[tokio::test]
    async fn switch_command_validates_the_target() {
        let (handler, bus, sessions) = handler();
        let target = sessions.create_session("elsewhere").unwrap();

        handler
            .handle_message(&inbound(&format!("/switch {}", target.id)))
            .await
            .unwrap();
        assert!(bus.consume_outbound().await.content.contains("已切换"));

        handler
            .handle_message(&inbound("/switch nope"))
            .await
            .unwrap();
        assert!(bus.consume_outbound().await.content.contains("不存在"));
    }

    #[tokio::test]
    async fn clear_command_wipes_history() {
        let (handler, bus, sessions) = handler();
        handler.handle_message(&inbound("hi")).await.unwrap();
        let _ = bus.consume_outbound().await;
        handler.handle_message(&inbound("/clear")).await.unwrap();
        let _ = bus.consume_outbound().await;

        let session = sessions.find_by_name("telegram:7").unwrap().unwrap();
        assert_eq!(sessions.message_count(&session.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_without_active_task_says_so() {
        let (handler, bus, _sessions) = handler();
        handler.handle_message(&inbound("/stop")).await.unwrap();
        assert!(bus.consume_outbound().await.content.contains("没有正在执行"));
    }

    #[tokio::test]
    async fn rate_limited_sender_gets_the_denial_text() {
        let dir = tempfile::TempDir::new().unwrap();
        let memory = Arc::new(MemoryStore::new(&dir.path().join("memory")).unwrap());
        let context = Arc::new(ContextBuilder::new(
            countbot_core::config::PersonaConfig::default(),
            memory.clone(),
            dir.path().to_path_buf(),
        ));
        std::mem::forget(dir);
        let agent = Arc::new(AgentLoop::new(
            Arc::new(EchoProvider),
            ToolRegistry::new(),
            context,
            LoopParams {
                model: "m".into(),
                temperature: 0.7,
                max_tokens: 256,
                max_iterations: 5,
            },
        ));
        let bus = Arc::new(MessageBus::new(None, false, 60));
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        countbot_sessions::db::init_db(&conn).unwrap();
        let sessions = Arc::new(SessionManager::new(conn));
        let limiter = Arc::new(RateLimiter::new(1, 60));
        let handler = Arc::new(ChannelMessageHandler::new(
            bus.clone(),
            Some(limiter),
            sessions,
            memory,
            agent,
            50,
        ));

        handler.handle_message(&inbound("one")).await.unwrap();
        let _ = bus.consume_outbound().await;
        handler.handle_message(&inbound("two")).await.unwrap();
        let denied = bus.consume_outbound().await;
        assert!(denied.content.contains("发送太频繁"));
    }

    #[tokio::test]
    async fn inbound_callback_prioritises_commands() {
        let (handler, bus, _sessions) = handler();
        let callback = handler.inbound_callback();
        callback(inbound("plain message"));
        callback(inbound("/stop"));
        // The command entered HIGH and dequeues first.
        let first = bus.dequeue().await;
        assert_eq!(first.message.content, "/stop");
        assert_eq!(first.priority, MessagePriority::High);
    }

    #[tokio::test]
    async fn queue_stats_shape() {
        let (handler, _bus, _sessions) = handler();
        let stats = handler.queue_stats();
        assert_eq!(stats["inbound_size"], 0);
        assert_eq!(stats["active_tasks"], 0);
    }
}
