//! Proactive greeting generation.
//!
//! Invoked by the cron executor when the builtin heartbeat job fires. Every
//! gate must pass before an LLM call is made: quiet window (Beijing time,
//! wrap-around supported), daily greet cap, user idle threshold, and a coin
//! flip that keeps the timing feeling natural.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Timelike;
use rand::Rng;
use tracing::{debug, error, info};

use countbot_agent::agent_loop::AgentLoop;
use countbot_agent::provider::{chat_collect, text_message, ChatRequest};
use countbot_core::config::HeartbeatConfig;
use countbot_memory::MemoryStore;
use countbot_sessions::SessionManager;

use crate::schedule::now_shanghai;

/// Probability of greeting once every other gate has passed.
const GREET_PROBABILITY: f64 = 0.5;
/// Greetings longer than this are discarded as off-script.
const MAX_GREETING_CHARS: usize = 200;

pub struct HeartbeatService {
    agent: Arc<AgentLoop>,
    sessions: Arc<SessionManager>,
    memory: Arc<MemoryStore>,
    config: RwLock<HeartbeatConfig>,
    /// "YYYY-MM-DD" -> greetings sent that day. Only the last few days are
    /// kept.
    greet_counts: Mutex<HashMap<String, u32>>,
}

impl HeartbeatService {
    pub fn new(
        agent: Arc<AgentLoop>,
        sessions: Arc<SessionManager>,
        memory: Arc<MemoryStore>,
        config: HeartbeatConfig,
    ) -> Self {
        debug!(
            idle = config.idle_threshold_hours,
            quiet_start = config.quiet_start,
            quiet_end = config.quiet_end,
            "heartbeat service initialised"
        );
        Self {
            agent,
            sessions,
            memory,
            config: RwLock::new(config),
            greet_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_config(&self, config: HeartbeatConfig) {
        *self.config.write().unwrap() = config;
    }

    /// Generate a greeting, or `None` when any gate declines. Delivery and
    /// session persistence are the executor's job.
    pub async fn execute(&self) -> Option<String> {
        let config = self.config.read().unwrap().clone();
        let now = now_shanghai();

        if is_quiet_hour(now.hour(), config.quiet_start, config.quiet_end) {
            debug!(hour = now.hour(), "heartbeat skipped: quiet hours");
            return None;
        }

        let today = now.format("%Y-%m-%d").to_string();
        {
            let counts = self.greet_counts.lock().unwrap();
            if counts.get(&today).copied().unwrap_or(0) >= config.max_greets_per_day {
                debug!("heartbeat skipped: daily greet cap reached");
                return None;
            }
        }

        let idle_hours = self.user_idle_hours()?;
        if idle_hours < config.idle_threshold_hours as f64 {
            debug!(idle_hours, "heartbeat skipped: user recently active");
            return None;
        }

        if rand::thread_rng().gen::<f64>() > GREET_PROBABILITY {
            debug!("heartbeat skipped: coin flip");
            return None;
        }

        let greeting = self.generate_greeting(now.hour(), idle_hours).await?;

        {
            let mut counts = self.greet_counts.lock().unwrap();
            let count = counts.entry(today.clone()).or_insert(0);
            *count += 1;
            info!(count = *count, "heartbeat greeting generated");
            // Drop stale date entries, keeping the last 3 days.
            if counts.len() > 3 {
                let mut dates: Vec<String> = counts.keys().cloned().collect();
                dates.sort();
                for old in &dates[..dates.len() - 3] {
                    counts.remove(old);
                }
            }
        }

        Some(greeting)
    }

    /// Hours since the newest user message anywhere in the store. `None`
    /// when there are no user messages yet (never greet a brand-new install).
    fn user_idle_hours(&self) -> Option<f64> {
        let last = self.sessions.last_user_message_at().ok()??;
        let last_at = chrono::DateTime::parse_from_rfc3339(&last).ok()?;
        let elapsed = chrono::Utc::now().signed_duration_since(last_at.with_timezone(&chrono::Utc));
        Some(elapsed.num_seconds() as f64 / 3600.0)
    }

    async fn generate_greeting(&self, hour: u32, idle_hours: f64) -> Option<String> {
        let time_desc = match hour {
            0..=11 => format!("上午{hour}点"),
            12..=13 => format!("中午{hour}点"),
            14..=17 => format!("下午{hour}点"),
            _ => format!("晚上{hour}点"),
        };

        let memory_context = match self.memory.get_recent(5) {
            Ok(recent) if !recent.contains("记忆为空") => {
                format!("最近的记忆（可参考但不必提及）:\n{recent}\n")
            }
            _ => String::new(),
        };

        let persona = self.agent.context().persona();
        let prompt = format!(
            "你是{ai_name}，{user_name}的私人AI助理。现在是{time_desc}，\
             {user_name}已经 {idle:.0} 小时没有说话了。\n{memory}\
             请主动发一句简短自然的问候（一两句话，不要问题清单，不要提你在\"检查\"什么）。",
            ai_name = persona.ai_name,
            user_name = persona.user_name,
            time_desc = time_desc,
            idle = idle_hours,
            memory = memory_context,
        );

        let mut request = ChatRequest::new(
            self.agent.params().model,
            vec![text_message("user", &prompt)],
        );
        request.temperature = 0.8;

        let provider = self.agent.provider();
        match chat_collect(provider.as_ref(), request).await {
            Ok(greeting) => {
                if greeting.is_empty() || greeting.chars().count() > MAX_GREETING_CHARS {
                    None
                } else {
                    Some(greeting)
                }
            }
            Err(e) => {
                error!("failed to generate greeting: {e}");
                None
            }
        }
    }
}

/// Quiet-window membership with wrap-around support: `22..8` covers hours
/// 22, 23, and 0 through 7.
pub fn is_quiet_hour(hour: u32, quiet_start: u32, quiet_end: u32) -> bool {
    if quiet_start <= quiet_end {
        quiet_start <= hour && hour < quiet_end
    } else {
        hour >= quiet_start || hour < quiet_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_window_wraps_midnight() {
        // 22:00 .. 08:00
        for hour in [22, 23, 0, 3, 7] {
            assert!(is_quiet_hour(hour, 22, 8), "hour {hour}");
        }
        for hour in [8, 12, 21] {
            assert!(!is_quiet_hour(hour, 22, 8), "hour {hour}");
        }
    }

    #[test]
    fn quiet_window_without_wrap() {
        assert!(is_quiet_hour(2, 1, 6));
        assert!(!is_quiet_hour(6, 1, 6));
        assert!(!is_quiet_hour(0, 1, 6));
    }

    #[test]
    fn empty_window_is_never_quiet() {
        for hour in 0..24 {
            assert!(!is_quiet_hour(hour, 8, 8));
        }
    }
}
