//! Precise-wake scheduler.
//!
//! One timer armed at the earliest `next_run` across enabled jobs (60 s idle
//! fallback). Job mutations ping the service's reschedule notifier, which
//! re-arms the timer immediately. Dispatch is bounded by a semaphore and an
//! in-flight set guarantees at most one concurrent run per job id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::CronExecutor;
use crate::schedule::now_shanghai;
use crate::service::CronService;

/// Parallel job executions.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
/// Per-job wall-clock budget (seconds).
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
/// Sleep when no job is scheduled (seconds).
const IDLE_WAKE_SECS: u64 = 60;
/// Grace period for in-flight jobs at shutdown (seconds).
const STOP_GRACE_SECS: u64 = 30;

pub struct Scheduler {
    service: Arc<CronService>,
    executor: Arc<CronExecutor>,
    semaphore: Arc<Semaphore>,
    job_timeout: Duration,
    reschedule: Arc<Notify>,
    shutdown: CancellationToken,
    /// job id -> cancel token for the running execution.
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Scheduler {
    pub fn new(
        service: Arc<CronService>,
        executor: Arc<CronExecutor>,
        max_concurrent: usize,
        job_timeout: Duration,
    ) -> Self {
        let reschedule = service.reschedule_notify();
        Self {
            service,
            executor,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            job_timeout,
            reschedule,
            shutdown: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn executor(&self) -> &Arc<CronExecutor> {
        &self.executor
    }

    pub fn active_job_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn is_job_active(&self, job_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(job_id)
    }

    /// Spawn the timer loop. Returns immediately; use [`Scheduler::stop`]
    /// to shut down.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    async fn run(self: Arc<Self>) {
        info!("cron scheduler started");
        if let Err(e) = self.service.recompute_next_runs() {
            error!("failed to recompute next runs on startup: {e}");
        }

        loop {
            let delay = self.delay_until_next_wake();
            debug!(delay_secs = delay.as_secs_f64(), "scheduler sleeping");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.dispatch_due().await;
                }
                _ = self.reschedule.notified() => {
                    // A mutation changed next_run; loop to re-arm the timer.
                    continue;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("cron scheduler stopping");
    }

    fn delay_until_next_wake(&self) -> Duration {
        match self.service.next_wake_time() {
            Ok(Some(next)) => {
                let now = now_shanghai();
                let delta = next.signed_duration_since(now);
                if delta.num_milliseconds() <= 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(delta.num_milliseconds() as u64)
                }
            }
            Ok(None) => Duration::from_secs(IDLE_WAKE_SECS),
            Err(e) => {
                error!("failed to query next wake time: {e}");
                Duration::from_secs(IDLE_WAKE_SECS)
            }
        }
    }

    /// Launch every due job that is not already in flight.
    pub async fn dispatch_due(self: &Arc<Self>) {
        let due = match self.service.get_due_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("failed to query due jobs: {e}");
                return;
            }
        };
        if due.is_empty() {
            return;
        }

        let mut launched = 0usize;
        for job in due {
            let cancel = {
                let mut active = self.active.lock().unwrap();
                if active.contains_key(&job.id) {
                    debug!(job_id = %job.id, "job already running, skipping this fire");
                    continue;
                }
                let token = CancellationToken::new();
                active.insert(job.id.clone(), token.clone());
                token
            };
            launched += 1;

            let scheduler = Arc::clone(self);
            let job_id = job.id.clone();
            tokio::spawn(async move {
                scheduler.run_job(job_id, cancel).await;
            });
        }
        if launched > 0 {
            info!(count = launched, "dispatched due cron jobs");
        }
    }

    async fn run_job(self: Arc<Self>, job_id: String, cancel: CancellationToken) {
        // Bounded concurrency: excess jobs wait here with their in-flight
        // slot already claimed, so the same id cannot pile up.
        let _permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        let started_at = now_shanghai();
        // Fresh load: the job may have been edited or disabled since dispatch.
        let job = match self.service.get_job(&job_id) {
            Ok(Some(job)) if job.enabled => job,
            Ok(_) => {
                debug!(job_id = %job_id, "job vanished or was disabled, skipping");
                self.active.lock().unwrap().remove(&job_id);
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, "failed to reload job: {e}");
                self.active.lock().unwrap().remove(&job_id);
                return;
            }
        };

        let outcome = tokio::time::timeout(
            self.job_timeout,
            self.executor.execute(&job, cancel.clone()),
        )
        .await;

        let record = match outcome {
            Err(_) => {
                cancel.cancel();
                error!(job_id = %job_id, timeout = ?self.job_timeout, "job timed out");
                self.service
                    .record_execution(
                        &job_id,
                        started_at,
                        "error",
                        Some(&format!("Timed out after {}s", self.job_timeout.as_secs())),
                        None,
                    )
                    .await
            }
            Ok(Ok(response)) => {
                self.service
                    .record_execution(&job_id, started_at, "ok", None, Some(&response))
                    .await
            }
            Ok(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "job failed");
                self.service
                    .record_execution(&job_id, started_at, "error", Some(&e), None)
                    .await
            }
        };
        if let Err(e) = record {
            error!(job_id = %job_id, "failed to record job execution: {e}");
        }

        self.active.lock().unwrap().remove(&job_id);
    }

    /// Stop the timer, wait up to 30 s for in-flight jobs, then cancel any
    /// stragglers.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(STOP_GRACE_SECS);
        while self.active_job_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let stragglers: Vec<(String, CancellationToken)> = {
            let active = self.active.lock().unwrap();
            active
                .iter()
                .map(|(id, token)| (id.clone(), token.clone()))
                .collect()
        };
        if !stragglers.is_empty() {
            warn!(count = stragglers.len(), "force-cancelling jobs after grace period");
            for (_, token) in stragglers {
                token.cancel();
            }
        }

        info!("cron scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CronJob;
    use async_trait::async_trait;
    use countbot_agent::agent_loop::{AgentLoop, LoopParams};
    use countbot_agent::prompt::ContextBuilder;
    use countbot_agent::provider::{ChatRequest, LlmProvider, StreamChunk};
    use countbot_agent::tools::ToolRegistry;
    use countbot_bus::MessageBus;
    use countbot_sessions::SessionManager;
    use tokio::sync::mpsc;

    struct SlowProvider {
        delay_ms: u64,
    }

    #[async_trait]
    impl LlmProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }
        async fn chat_stream(&self, _req: ChatRequest) -> mpsc::Receiver<StreamChunk> {
            let (tx, rx) = mpsc::channel(4);
            let delay = self.delay_ms;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = tx.send(StreamChunk::Content("tick done".into())).await;
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

    fn scheduler_with(delay_ms: u64, timeout: Duration) -> (Arc<Scheduler>, Arc<CronService>) {
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
            Arc::new(SlowProvider { delay_ms }),
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
        let executor = Arc::new(CronExecutor::new(agent, bus, sessions, None));

        let conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        let service = Arc::new(CronService::new(conn));

        (
            Arc::new(Scheduler::new(
                Arc::clone(&service),
                executor,
                DEFAULT_MAX_CONCURRENT,
                timeout,
            )),
            service,
        )
    }

    fn make_due(service: &CronService) -> CronJob {
        let job = service
            .add_job("tick", "*/1 * * * *", "tick", true, None, None, false)
            .unwrap();
        service.force_next_run_for_tests(&job.id, "2020-01-01 00:00:00");
        service.get_job(&job.id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn due_job_executes_once_and_advances() {
        let (scheduler, service) = scheduler_with(10, Duration::from_secs(30));
        let job = make_due(&service);

        scheduler.dispatch_due().await;

        // Wait for the background run to settle.
        for _ in 0..100 {
            let current = service.get_job(&job.id).unwrap().unwrap();
            if current.run_count == 1 {
                assert_eq!(current.last_status.as_deref(), Some("ok"));
                assert_eq!(current.last_response.as_deref(), Some("tick done"));
                // next_run strictly after last_run.
                assert!(current.next_run.unwrap() > current.last_run.unwrap());
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never ran");
    }

    #[tokio::test]
    async fn in_flight_job_is_not_dispatched_twice() {
        let (scheduler, service) = scheduler_with(500, Duration::from_secs(30));
        let job = make_due(&service);

        scheduler.dispatch_due().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.is_job_active(&job.id));

        // Still due (next_run not advanced yet) but already running.
        scheduler.dispatch_due().await;
        tokio::time::sleep(Duration::from_millis(700)).await;

        let current = service.get_job(&job.id).unwrap().unwrap();
        assert_eq!(current.run_count, 1);
    }

    #[tokio::test]
    async fn timed_out_job_records_an_error() {
        let (scheduler, service) = scheduler_with(5_000, Duration::from_millis(100));
        let job = make_due(&service);

        scheduler.dispatch_due().await;
        for _ in 0..100 {
            let current = service.get_job(&job.id).unwrap().unwrap();
            if current.run_count == 1 {
                assert_eq!(current.last_status.as_deref(), Some("error"));
                assert!(current.last_error.unwrap().contains("Timed out"));
                assert_eq!(current.error_count, 1);
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timeout was never recorded");
    }

    #[tokio::test]
    async fn stop_waits_for_active_jobs() {
        let (scheduler, service) = scheduler_with(200, Duration::from_secs(30));
        let _job = make_due(&service);
        scheduler.dispatch_due().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await;
        assert_eq!(scheduler.active_job_count(), 0);
    }
}
