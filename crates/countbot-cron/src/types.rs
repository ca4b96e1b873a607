use serde::{Deserialize, Serialize};

/// Fixed id of the built-in heartbeat job.
pub const HEARTBEAT_JOB_ID: &str = "builtin:heartbeat";
/// Marker payload routed to the HeartbeatService instead of the agent.
pub const HEARTBEAT_MESSAGE_MARKER: &str = "__heartbeat__";
/// Prefix of system-managed job ids with restricted mutation.
pub const BUILTIN_PREFIX: &str = "builtin:";

/// A persisted scheduled job.
///
/// Timestamps are naive Beijing-time strings (`YYYY-MM-DD HH:MM:SS`); the
/// format compares lexically, which the due-job query relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    /// 5-field POSIX cron expression, interpreted in Asia/Shanghai.
    pub schedule: String,
    /// The user-turn payload, or [`HEARTBEAT_MESSAGE_MARKER`].
    pub message: String,
    pub enabled: bool,
    /// Delivery target. Both must be set for `deliver_response` to work.
    pub channel: Option<String>,
    pub chat_id: Option<String>,
    pub deliver_response: bool,
    pub last_run: Option<String>,
    /// Set iff `enabled`; strictly in the future at rest.
    pub next_run: Option<String>,
    /// ok | error | skipped.
    pub last_status: Option<String>,
    pub last_error: Option<String>,
    pub last_response: Option<String>,
    pub run_count: i64,
    pub error_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl CronJob {
    pub fn is_builtin(&self) -> bool {
        self.id.starts_with(BUILTIN_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_detection_uses_the_id_prefix() {
        let mut job = CronJob {
            id: "builtin:heartbeat".into(),
            name: "hb".into(),
            schedule: "0 * * * *".into(),
            message: HEARTBEAT_MESSAGE_MARKER.into(),
            enabled: true,
            channel: None,
            chat_id: None,
            deliver_response: false,
            last_run: None,
            next_run: None,
            last_status: None,
            last_error: None,
            last_response: None,
            run_count: 0,
            error_count: 0,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(job.is_builtin());
        job.id = "8d0f".into();
        assert!(!job.is_builtin());
    }
}
