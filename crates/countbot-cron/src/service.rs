//! CRUD and schedule bookkeeping for cron jobs.
//!
//! Builtin jobs (id prefixed `builtin:`) are system-owned: users may toggle
//! enable, schedule, and delivery target, but may not rename them, change
//! their payload, or delete them. Mutations nudge the scheduler to re-arm
//! its timer via a `Notify`.

use std::sync::{Arc, Mutex};

use chrono::NaiveDateTime;
use rusqlite::Connection;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use countbot_core::config::HeartbeatConfig;

use crate::error::{CronError, Result};
use crate::schedule::{calculate_next_run, format_time, now_shanghai, validate_schedule};
use crate::types::{CronJob, HEARTBEAT_JOB_ID, HEARTBEAT_MESSAGE_MARKER};

/// Retries on `database is locked` before surfacing the error.
const MAX_LOCK_RETRIES: u32 = 3;

#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub message: Option<String>,
    pub enabled: Option<bool>,
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub deliver_response: Option<bool>,
}

pub struct CronService {
    conn: Arc<Mutex<Connection>>,
    /// Pinged after every mutation so the scheduler re-arms its timer.
    reschedule: Arc<Notify>,
}

impl CronService {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            reschedule: Arc::new(Notify::new()),
        }
    }

    /// The notifier the scheduler listens on.
    pub fn reschedule_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.reschedule)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_job(
        &self,
        name: &str,
        schedule: &str,
        message: &str,
        enabled: bool,
        channel: Option<&str>,
        chat_id: Option<&str>,
        deliver_response: bool,
    ) -> Result<CronJob> {
        if !validate_schedule(schedule) {
            return Err(CronError::InvalidSchedule(schedule.to_string()));
        }
        let next_run = if enabled {
            Some(format_time(calculate_next_run(schedule, None)?))
        } else {
            None
        };

        let id = Uuid::new_v4().to_string();
        let now = format_time(now_shanghai());
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO cron_jobs
                 (id, name, schedule, message, enabled, channel, chat_id,
                  deliver_response, next_run, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                rusqlite::params![
                    id,
                    name,
                    schedule,
                    message,
                    enabled,
                    channel,
                    chat_id,
                    deliver_response,
                    next_run,
                    now
                ],
            )?;
        }
        info!(job_id = %id, name, schedule, "cron job created");
        self.reschedule.notify_one();
        self.get_job(&id)?
            .ok_or(CronError::JobNotFound { id })
    }

    pub fn get_job(&self, id: &str) -> Result<Option<CronJob>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            &format!("SELECT {COLUMNS} FROM cron_jobs WHERE id = ?1"),
            rusqlite::params![id],
            row_to_job,
        ) {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_jobs(&self, enabled_only: bool) -> Result<Vec<CronJob>> {
        let conn = self.conn.lock().unwrap();
        let sql = if enabled_only {
            format!("SELECT {COLUMNS} FROM cron_jobs WHERE enabled = 1 ORDER BY created_at DESC")
        } else {
            format!("SELECT {COLUMNS} FROM cron_jobs ORDER BY created_at DESC")
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Enabled jobs due at or before now, earliest first.
    pub fn get_due_jobs(&self) -> Result<Vec<CronJob>> {
        let now = format_time(now_shanghai());
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM cron_jobs
             WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![now], row_to_job)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Earliest `next_run` across enabled jobs.
    pub fn next_wake_time(&self) -> Result<Option<NaiveDateTime>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn.query_row(
            "SELECT MIN(next_run) FROM cron_jobs WHERE enabled = 1 AND next_run IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(raw.and_then(|s| NaiveDateTime::parse_from_str(&s, crate::schedule::TIME_FORMAT).ok()))
    }

    pub fn update_job(&self, id: &str, update: JobUpdate) -> Result<CronJob> {
        let Some(job) = self.get_job(id)? else {
            return Err(CronError::JobNotFound { id: id.to_string() });
        };

        if job.is_builtin() {
            if update.name.is_some() {
                return Err(CronError::BuiltinProtected("name".to_string()));
            }
            if update.message.is_some() {
                return Err(CronError::BuiltinProtected("message".to_string()));
            }
        }

        if let Some(ref schedule) = update.schedule {
            if !validate_schedule(schedule) {
                return Err(CronError::InvalidSchedule(schedule.clone()));
            }
        }

        let name = update.name.unwrap_or(job.name);
        let schedule = update.schedule.unwrap_or(job.schedule);
        let message = update.message.unwrap_or(job.message);
        let enabled = update.enabled.unwrap_or(job.enabled);
        let channel = update.channel.or(job.channel);
        let chat_id = update.chat_id.or(job.chat_id);
        let deliver_response = update.deliver_response.unwrap_or(job.deliver_response);

        let next_run = if enabled {
            Some(format_time(calculate_next_run(&schedule, None)?))
        } else {
            None
        };
        let now = format_time(now_shanghai());

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE cron_jobs SET name = ?1, schedule = ?2, message = ?3, enabled = ?4,
                 channel = ?5, chat_id = ?6, deliver_response = ?7, next_run = ?8,
                 updated_at = ?9 WHERE id = ?10",
                rusqlite::params![
                    name,
                    schedule,
                    message,
                    enabled,
                    channel,
                    chat_id,
                    deliver_response,
                    next_run,
                    now,
                    id
                ],
            )?;
        }
        info!(job_id = %id, "cron job updated");
        self.reschedule.notify_one();
        self.get_job(id)?
            .ok_or_else(|| CronError::JobNotFound { id: id.to_string() })
    }

    pub fn delete_job(&self, id: &str) -> Result<()> {
        let Some(job) = self.get_job(id)? else {
            return Err(CronError::JobNotFound { id: id.to_string() });
        };
        if job.is_builtin() {
            return Err(CronError::BuiltinProtected("delete".to_string()));
        }
        {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM cron_jobs WHERE id = ?1", rusqlite::params![id])?;
        }
        info!(job_id = %id, "cron job deleted");
        self.reschedule.notify_one();
        Ok(())
    }

    /// Recompute `next_run` for every enabled job (scheduler startup).
    pub fn recompute_next_runs(&self) -> Result<()> {
        let jobs = self.list_jobs(true)?;
        for job in jobs {
            match calculate_next_run(&job.schedule, None) {
                Ok(next) => {
                    let conn = self.conn.lock().unwrap();
                    conn.execute(
                        "UPDATE cron_jobs SET next_run = ?1 WHERE id = ?2",
                        rusqlite::params![format_time(next), job.id],
                    )?;
                }
                Err(e) => warn!(job_id = %job.id, "failed to recompute next run: {e}"),
            }
        }
        Ok(())
    }

    /// Record an execution outcome and advance the schedule from `started_at`.
    ///
    /// `status` is ok | error | skipped. Response and error strings are
    /// clamped to 1000 characters. Recomputation failure (the expression
    /// went bad) disables the job and records why. Retries writes on a
    /// locked database with linear backoff.
    pub async fn record_execution(
        &self,
        id: &str,
        started_at: NaiveDateTime,
        status: &str,
        error: Option<&str>,
        response: Option<&str>,
    ) -> Result<()> {
        let Some(job) = self.get_job(id)? else {
            return Err(CronError::JobNotFound { id: id.to_string() });
        };

        let clamp = |s: &str| s.chars().take(1000).collect::<String>();
        let error = error.map(clamp);
        let response = response.map(clamp);

        let (next_run, enabled, final_error) = if job.enabled {
            match calculate_next_run(&job.schedule, Some(started_at)) {
                Ok(next) => (Some(format_time(next)), true, error),
                Err(e) => {
                    warn!(job_id = %id, "next run recomputation failed, disabling: {e}");
                    (None, false, Some(clamp(&format!("Invalid schedule: {e}"))))
                }
            }
        } else {
            (None, false, error)
        };

        let is_error = status == "error";
        let now = format_time(now_shanghai());
        let started = format_time(started_at);

        for attempt in 0..MAX_LOCK_RETRIES {
            let result = {
                let conn = self.conn.lock().unwrap();
                conn.execute(
                    "UPDATE cron_jobs SET last_run = ?1, last_status = ?2, last_error = ?3,
                     last_response = ?4, run_count = run_count + 1,
                     error_count = error_count + ?5, next_run = ?6, enabled = ?7,
                     updated_at = ?8 WHERE id = ?9",
                    rusqlite::params![
                        started,
                        status,
                        final_error,
                        response,
                        if is_error { 1 } else { 0 },
                        next_run,
                        enabled,
                        now,
                        id
                    ],
                )
            };
            match result {
                Ok(_) => break,
                Err(e) if is_locked(&e) && attempt + 1 < MAX_LOCK_RETRIES => {
                    let wait = std::time::Duration::from_millis(500 * (attempt as u64 + 1));
                    warn!(job_id = %id, attempt = attempt + 1, "database locked, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.reschedule.notify_one();
        Ok(())
    }

    /// Create or sync the builtin heartbeat job from the persona config.
    /// Name and payload are pinned; schedule, target, and enabled follow
    /// the config.
    pub fn ensure_heartbeat_job(&self, config: &HeartbeatConfig) -> Result<()> {
        let schedule = if validate_schedule(&config.schedule) {
            config.schedule.clone()
        } else {
            warn!(schedule = %config.schedule, "invalid heartbeat schedule, using hourly");
            "0 * * * *".to_string()
        };
        let next_run = if config.enabled {
            Some(format_time(calculate_next_run(&schedule, None)?))
        } else {
            None
        };
        let now = format_time(now_shanghai());

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO cron_jobs
             (id, name, schedule, message, enabled, channel, chat_id,
              deliver_response, next_run, created_at, updated_at)
             VALUES (?1, '系统问候（内置）', ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)
             ON CONFLICT(id) DO UPDATE SET
                schedule = ?2, enabled = ?4, channel = ?5, chat_id = ?6,
                next_run = ?7, updated_at = ?8",
            rusqlite::params![
                HEARTBEAT_JOB_ID,
                schedule,
                HEARTBEAT_MESSAGE_MARKER,
                config.enabled,
                config.channel,
                config.chat_id,
                next_run,
                now
            ],
        )?;
        drop(conn);
        self.reschedule.notify_one();
        Ok(())
    }
}

#[cfg(test)]
impl CronService {
    /// Test-only: force a job due at a fixed instant.
    pub(crate) fn force_next_run_for_tests(&self, id: &str, when: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE cron_jobs SET next_run = ?1 WHERE id = ?2",
            rusqlite::params![when, id],
        )
        .unwrap();
    }
}

fn is_locked(e: &rusqlite::Error) -> bool {
    e.to_string().to_lowercase().contains("database is locked")
}

const COLUMNS: &str = "id, name, schedule, message, enabled, channel, chat_id, \
     deliver_response, last_run, next_run, last_status, last_error, \
     last_response, run_count, error_count, created_at, updated_at";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<CronJob> {
    Ok(CronJob {
        id: row.get(0)?,
        name: row.get(1)?,
        schedule: row.get(2)?,
        message: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        channel: row.get(5)?,
        chat_id: row.get(6)?,
        deliver_response: row.get::<_, i64>(7)? != 0,
        last_run: row.get(8)?,
        next_run: row.get(9)?,
        last_status: row.get(10)?,
        last_error: row.get(11)?,
        last_response: row.get(12)?,
        run_count: row.get(13)?,
        error_count: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CronService {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        CronService::new(conn)
    }

    #[test]
    fn add_job_sets_a_future_next_run() {
        let s = service();
        let job = s
            .add_job("tick", "*/1 * * * *", "tick", true, None, None, false)
            .unwrap();
        let next = job.next_run.unwrap();
        assert!(next > format_time(now_shanghai()));
        assert_eq!(job.run_count, 0);
    }

    #[test]
    fn disabled_job_has_no_next_run() {
        let s = service();
        let job = s
            .add_job("off", "0 * * * *", "x", false, None, None, false)
            .unwrap();
        assert!(job.next_run.is_none());
    }

    #[test]
    fn invalid_schedule_is_rejected() {
        let s = service();
        let err = s
            .add_job("bad", "99 99 * * *", "x", true, None, None, false)
            .unwrap_err();
        assert!(matches!(err, CronError::InvalidSchedule(_)));
    }

    #[test]
    fn update_toggles_enabled_and_next_run() {
        let s = service();
        let job = s
            .add_job("t", "0 * * * *", "x", true, None, None, false)
            .unwrap();
        let updated = s
            .update_job(
                &job.id,
                JobUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!updated.enabled);
        assert!(updated.next_run.is_none());
    }

    #[test]
    fn builtin_name_and_message_are_protected() {
        let s = service();
        s.ensure_heartbeat_job(&HeartbeatConfig::default()).unwrap();

        let err = s
            .update_job(
                HEARTBEAT_JOB_ID,
                JobUpdate {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CronError::BuiltinProtected(_)));

        let err = s
            .update_job(
                HEARTBEAT_JOB_ID,
                JobUpdate {
                    message: Some("not heartbeat".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CronError::BuiltinProtected(_)));

        // Toggling enable and schedule stays allowed.
        let updated = s
            .update_job(
                HEARTBEAT_JOB_ID,
                JobUpdate {
                    enabled: Some(true),
                    schedule: Some("*/30 * * * *".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.enabled);
        assert_eq!(updated.schedule, "*/30 * * * *");
    }

    #[test]
    fn builtin_cannot_be_deleted() {
        let s = service();
        s.ensure_heartbeat_job(&HeartbeatConfig::default()).unwrap();
        let err = s.delete_job(HEARTBEAT_JOB_ID).unwrap_err();
        assert!(matches!(err, CronError::BuiltinProtected(_)));
    }

    #[test]
    fn ensure_heartbeat_is_idempotent_and_syncs_config() {
        let s = service();
        let mut cfg = HeartbeatConfig::default();
        s.ensure_heartbeat_job(&cfg).unwrap();
        cfg.enabled = true;
        cfg.channel = "telegram".into();
        cfg.chat_id = "7".into();
        s.ensure_heartbeat_job(&cfg).unwrap();

        let jobs = s.list_jobs(false).unwrap();
        assert_eq!(jobs.len(), 1);
        let hb = &jobs[0];
        assert!(hb.enabled);
        assert_eq!(hb.channel.as_deref(), Some("telegram"));
        assert_eq!(hb.message, HEARTBEAT_MESSAGE_MARKER);
    }

    #[test]
    fn due_jobs_are_returned_earliest_first() {
        let s = service();
        let a = s
            .add_job("a", "0 * * * *", "x", true, None, None, false)
            .unwrap();
        let b = s
            .add_job("b", "0 * * * *", "x", true, None, None, false)
            .unwrap();
        // Force both into the past with distinct instants.
        {
            let conn = s.conn.lock().unwrap();
            conn.execute(
                "UPDATE cron_jobs SET next_run = '2020-01-01 00:00:05' WHERE id = ?1",
                rusqlite::params![a.id],
            )
            .unwrap();
            conn.execute(
                "UPDATE cron_jobs SET next_run = '2020-01-01 00:00:01' WHERE id = ?1",
                rusqlite::params![b.id],
            )
            .unwrap();
        }
        let due = s.get_due_jobs().unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, b.id);
    }

    #[tokio::test]
    async fn record_execution_updates_stats_and_advances() {
        let s = service();
        let job = s
            .add_job("t", "*/1 * * * *", "tick", true, None, None, false)
            .unwrap();
        let started = now_shanghai();
        s.record_execution(&job.id, started, "ok", None, Some("done"))
            .await
            .unwrap();

        let job = s.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.error_count, 0);
        assert_eq!(job.last_status.as_deref(), Some("ok"));
        assert_eq!(job.last_response.as_deref(), Some("done"));
        assert_eq!(job.last_run.as_deref(), Some(format_time(started).as_str()));
        // next_run strictly after last_run.
        assert!(job.next_run.unwrap() > job.last_run.unwrap());
    }

    #[tokio::test]
    async fn record_execution_clamps_long_errors() {
        let s = service();
        let job = s
            .add_job("t", "*/1 * * * *", "tick", true, None, None, false)
            .unwrap();
        let long_error = "e".repeat(5000);
        s.record_execution(&job.id, now_shanghai(), "error", Some(&long_error), None)
            .await
            .unwrap();
        let job = s.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.last_error.unwrap().chars().count(), 1000);
        assert_eq!(job.error_count, 1);
    }
}
