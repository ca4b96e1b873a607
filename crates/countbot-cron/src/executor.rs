//! Per-job execution: agent turn, session persistence, channel delivery.

use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use countbot_agent::agent_loop::AgentLoop;
use countbot_bus::MessageBus;
use countbot_core::types::OutboundMessage;
use countbot_sessions::SessionManager;

use crate::heartbeat::HeartbeatService;
use crate::types::{CronJob, HEARTBEAT_MESSAGE_MARKER};

pub struct CronExecutor {
    agent: Arc<AgentLoop>,
    bus: Arc<MessageBus>,
    sessions: Arc<SessionManager>,
    heartbeat: Option<Arc<HeartbeatService>>,
}

impl CronExecutor {
    pub fn new(
        agent: Arc<AgentLoop>,
        bus: Arc<MessageBus>,
        sessions: Arc<SessionManager>,
        heartbeat: Option<Arc<HeartbeatService>>,
    ) -> Self {
        Self {
            agent,
            bus,
            sessions,
            heartbeat,
        }
    }

    /// Run one job to completion and return the response text (possibly
    /// empty). The scheduler wraps this with the timeout and records stats.
    pub async fn execute(
        &self,
        job: &CronJob,
        cancel: CancellationToken,
    ) -> std::result::Result<String, String> {
        info!(job_id = %job.id, name = %job.name, "executing cron job");

        if job.message == HEARTBEAT_MESSAGE_MARKER {
            return self.execute_heartbeat(job).await;
        }

        let session_id = match (&job.channel, &job.chat_id) {
            (Some(channel), Some(chat_id)) => self
                .resolve_session(channel, chat_id)
                .map_err(|e| format!("session resolution failed: {e}"))?,
            _ => format!("cron:{}", job.id),
        };

        let mut stream = self.agent.process_message(
            job.message.clone(),
            session_id.clone(),
            Vec::new(),
            Vec::new(),
            cancel,
        );
        let mut response = String::new();
        while let Some(chunk) = stream.next().await {
            response.push_str(&chunk);
        }
        let response = response.trim().to_string();

        if let (Some(channel), Some(chat_id)) = (&job.channel, &job.chat_id) {
            if !response.is_empty() {
                // Persist the turn the same way channel traffic is stored.
                if let Err(e) = self.sessions.add_message(&session_id, "user", &job.message) {
                    warn!(job_id = %job.id, "failed to save cron user turn: {e}");
                }
                if let Err(e) = self.sessions.add_message(&session_id, "assistant", &response) {
                    warn!(job_id = %job.id, "failed to save cron assistant turn: {e}");
                }

                if job.deliver_response {
                    self.bus
                        .publish_outbound(OutboundMessage::text(channel, chat_id, &response));
                }
            }
        }

        info!(job_id = %job.id, "cron job completed");
        Ok(response)
    }

    async fn execute_heartbeat(&self, job: &CronJob) -> std::result::Result<String, String> {
        let Some(ref heartbeat) = self.heartbeat else {
            warn!("heartbeat service not configured, skipping");
            return Ok(String::new());
        };

        let Some(greeting) = heartbeat.execute().await else {
            return Ok(String::new());
        };

        match (&job.channel, &job.chat_id) {
            (Some(channel), Some(chat_id)) if !channel.is_empty() && !chat_id.is_empty() => {
                self.bus
                    .publish_outbound(OutboundMessage::text(channel, chat_id, &greeting));

                // Save the greeting so the AI sees it when the user replies.
                match self.resolve_session(channel, chat_id) {
                    Ok(session_id) => {
                        if let Err(e) =
                            self.sessions.add_message(&session_id, "assistant", &greeting)
                        {
                            warn!("failed to save greeting to session: {e}");
                        }
                    }
                    Err(e) => warn!("failed to resolve greeting session: {e}"),
                }
            }
            _ => warn!(
                "heartbeat: no channel/chat_id configured on the heartbeat job, \
                 greeting generated but not delivered"
            ),
        }

        Ok(greeting)
    }

    /// `{channel}:{chat_id}` session, created on first use.
    fn resolve_session(
        &self,
        channel: &str,
        chat_id: &str,
    ) -> countbot_sessions::Result<String> {
        let name = format!("{channel}:{chat_id}");
        if let Some(session) = self.sessions.find_by_name(&name)? {
            return Ok(session.id);
        }
        Ok(self.sessions.create_session(&name)?.id)
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

    struct FixedProvider(&'static str);

    #[async_trait]
    impl LlmProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn chat_stream(&self, _req: ChatRequest) -> mpsc::Receiver<StreamChunk> {
            let (tx, rx) = mpsc::channel(4);
            let text = self.0;
            tokio::spawn(async move {
                let _ = tx.send(StreamChunk::Content(text.to_string())).await;
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

    fn fixture(reply: &'static str) -> (CronExecutor, Arc<MessageBus>, Arc<SessionManager>) {
        let dir = tempfile::TempDir::new().unwrap();
        let memory =
            Arc::new(countbot_memory::MemoryStore::new(&dir.path().join("memory")).unwrap());
        let context = Arc::new(ContextBuilder::new(
            countbot_core::config::PersonaConfig::default(),
            memory,
            dir.path().to_path_buf(),
        ));
        std::mem::forget(dir);
        let agent = Arc::new(AgentLoop::new(
            Arc::new(FixedProvider(reply)),
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
        (
            CronExecutor::new(agent, bus.clone(), sessions.clone(), None),
            bus,
            sessions,
        )
    }

    fn job(channel: Option<&str>, chat: Option<&str>, deliver: bool) -> CronJob {
        CronJob {
            id: "job-1".into(),
            name: "tick".into(),
            schedule: "*/1 * * * *".into(),
            message: "早报".into(),
            enabled: true,
            channel: channel.map(String::from),
            chat_id: chat.map(String::from),
            deliver_response: deliver,
            last_run: None,
            next_run: None,
            last_status: None,
            last_error: None,
            last_response: None,
            run_count: 0,
            error_count: 0,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[tokio::test]
    async fn job_with_channel_persists_turn_and_delivers() {
        let (executor, bus, sessions) = fixture("今日新闻如下");
        let response = executor
            .execute(&job(Some("telegram"), Some("7"), true), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response, "今日新闻如下");

        let session = sessions.find_by_name("telegram:7").unwrap().unwrap();
        let msgs = sessions.get_messages(&session.id, None, 0).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[1].role, "assistant");

        let out = bus.consume_outbound().await;
        assert_eq!(out.channel, "telegram");
        assert_eq!(out.content, "今日新闻如下");
    }

    #[tokio::test]
    async fn job_without_channel_runs_in_cron_session() {
        let (executor, bus, sessions) = fixture("done");
        let response = executor
            .execute(&job(None, None, false), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response, "done");
        // No channel: nothing persisted, nothing delivered.
        assert!(sessions.find_by_name("cron:job-1").unwrap().is_none());
        assert_eq!(bus.outbound_size(), 0);
    }

    #[tokio::test]
    async fn delivery_disabled_keeps_response_off_the_bus() {
        let (executor, bus, _sessions) = fixture("quiet");
        executor
            .execute(&job(Some("telegram"), Some("7"), false), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bus.outbound_size(), 0);
    }

    #[tokio::test]
    async fn heartbeat_without_service_is_a_noop() {
        let (executor, bus, _sessions) = fixture("unused");
        let mut hb_job = job(Some("telegram"), Some("7"), true);
        hb_job.message = HEARTBEAT_MESSAGE_MARKER.into();
        let response = executor
            .execute(&hb_job, CancellationToken::new())
            .await
            .unwrap();
        assert!(response.is_empty());
        assert_eq!(bus.outbound_size(), 0);
    }
}
