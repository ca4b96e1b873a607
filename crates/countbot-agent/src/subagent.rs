//! Background subagent tasks.
//!
//! `spawn_subagent` dispatches a bounded, restricted agent run in the
//! background: no subagent or channel-send tools, iteration cap 15 (wired
//! into the restricted loop at construction). The parent turn gets a
//! synchronous "dispatched" message; terminal state is queried through the
//! task API.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent_loop::AgentLoop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubagentTask {
    pub task_id: String,
    pub label: String,
    pub message: String,
    /// Session of the conversation that spawned this task, if any.
    pub session_id: Option<String>,
    pub status: TaskStatus,
    /// 0–100.
    pub progress: u8,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub struct SubagentManager {
    /// Restricted agent loop: capped iterations, trimmed tool registry.
    agent: Arc<AgentLoop>,
    tasks: DashMap<String, SubagentTask>,
    cancels: DashMap<String, CancellationToken>,
    /// Lifecycle notifications for WebSocket clients, pre-shaped as frames.
    events: tokio::sync::broadcast::Sender<serde_json::Value>,
}

impl SubagentManager {
    pub fn new(agent: Arc<AgentLoop>) -> Self {
        let (events, _) = tokio::sync::broadcast::channel(64);
        Self {
            agent,
            tasks: DashMap::new(),
            cancels: DashMap::new(),
            events,
        }
    }

    /// Subscribe to task lifecycle frames (`task_created`, `task_status`,
    /// `task_complete`, `task_failed`).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<serde_json::Value> {
        self.events.subscribe()
    }

    fn notify(&self, event: &str, task_id: &str) {
        if let Some(task) = self.get(task_id) {
            let _ = self.events.send(serde_json::json!({
                "type": event,
                "task": task,
            }));
        }
    }

    /// Create a task and start it in the background. Returns the task id
    /// immediately.
    pub fn spawn(
        self: &Arc<Self>,
        label: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let task = SubagentTask {
            task_id: task_id.clone(),
            label: label.to_string(),
            message: message.to_string(),
            session_id: session_id.map(String::from),
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            created_at: now(),
            started_at: None,
            completed_at: None,
        };
        self.tasks.insert(task_id.clone(), task);
        info!(task_id = %task_id, label, "subagent task created");
        self.notify("task_created", &task_id);

        let cancel = CancellationToken::new();
        self.cancels.insert(task_id.clone(), cancel.clone());

        let manager = Arc::clone(self);
        let id = task_id.clone();
        let prompt = message.to_string();
        tokio::spawn(async move {
            manager.run_task(id, prompt, cancel).await;
        });

        task_id
    }

    async fn run_task(&self, task_id: String, prompt: String, cancel: CancellationToken) {
        self.update(&task_id, |t| {
            t.status = TaskStatus::Running;
            t.progress = 10;
            t.started_at = Some(now());
        });
        self.notify("task_status", &task_id);

        let mut stream = self.agent.process_message(
            prompt,
            format!("subagent:{task_id}"),
            Vec::new(),
            Vec::new(),
            cancel.clone(),
        );

        let mut parts = String::new();
        while let Some(chunk) = stream.next().await {
            parts.push_str(&chunk);
        }

        self.cancels.remove(&task_id);

        if cancel.is_cancelled() {
            self.update(&task_id, |t| {
                t.status = TaskStatus::Cancelled;
                t.completed_at = Some(now());
            });
            self.notify("task_status", &task_id);
            return;
        }

        let result = parts.trim().to_string();
        if result.is_empty() {
            warn!(task_id = %task_id, "subagent produced no output");
            self.update(&task_id, |t| {
                t.status = TaskStatus::Failed;
                t.error = Some("子任务未产生任何输出".to_string());
                t.completed_at = Some(now());
            });
            self.notify("task_failed", &task_id);
        } else {
            self.update(&task_id, |t| {
                t.status = TaskStatus::Completed;
                t.progress = 100;
                t.result = Some(result.clone());
                t.completed_at = Some(now());
            });
            info!(task_id = %task_id, "subagent task completed");
            self.notify("task_complete", &task_id);
        }
    }

    fn update(&self, task_id: &str, f: impl FnOnce(&mut SubagentTask)) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            f(&mut task);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<SubagentTask> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// All tasks, newest first.
    pub fn list(&self) -> Vec<SubagentTask> {
        let mut tasks: Vec<SubagentTask> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Cancel a running task. Returns `false` when the task is unknown or
    /// already finished.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.cancels.get(task_id) {
            Some(cancel) => {
                cancel.cancel();
                info!(task_id, "subagent task cancelled");
                true
            }
            None => false,
        }
    }

    /// Remove a finished task record.
    pub fn delete(&self, task_id: &str) -> bool {
        self.cancels.remove(task_id);
        self.tasks.remove(task_id).is_some()
    }

    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats {
            total: 0,
            pending: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
        };
        for task in self.tasks.iter() {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_loop::LoopParams;
    use crate::prompt::ContextBuilder;
    use crate::provider::{ChatRequest, LlmProvider, StreamChunk};
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct OneShotProvider(String);

    #[async_trait]
    impl LlmProvider for OneShotProvider {
        fn name(&self) -> &str {
            "oneshot"
        }
        async fn chat_stream(&self, _req: ChatRequest) -> mpsc::Receiver<StreamChunk> {
            let (tx, rx) = mpsc::channel(4);
            let text = self.0.clone();
            tokio::spawn(async move {
                let _ = tx.send(StreamChunk::Content(text)).await;
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

    fn manager(reply: &str) -> Arc<SubagentManager> {
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
            Arc::new(OneShotProvider(reply.to_string())),
            ToolRegistry::new(),
            context,
            LoopParams {
                model: "m".into(),
                temperature: 0.7,
                max_tokens: 256,
                max_iterations: 15,
            },
        ));
        Arc::new(SubagentManager::new(agent))
    }

    #[tokio::test]
    async fn spawned_task_completes_with_result() {
        let manager = manager("task done");
        let id = manager.spawn("research", "look things up", Some("s1"));

        // Poll until the background task settles.
        for _ in 0..50 {
            if let Some(task) = manager.get(&id) {
                if task.status == TaskStatus::Completed {
                    assert_eq!(task.result.as_deref(), Some("task done"));
                    assert_eq!(task.progress, 100);
                    assert!(task.completed_at.is_some());
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("task never completed");
    }

    #[tokio::test]
    async fn stats_aggregate_by_status() {
        let manager = manager("ok");
        manager.spawn("a", "x", None);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let stats = manager.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn unknown_task_cannot_be_cancelled() {
        let manager = manager("ok");
        assert!(!manager.cancel("nope"));
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let manager = manager("ok");
        let id = manager.spawn("a", "x", None);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(manager.delete(&id));
        assert!(manager.get(&id).is_none());
    }
}
