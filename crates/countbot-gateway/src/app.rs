//! Shared application state and router assembly.

use std::sync::{Arc, RwLock};

use axum::routing::{delete, get, post, put};
use axum::Router;
use dashmap::DashMap;

use countbot_agent::agent_loop::AgentLoop;
use countbot_agent::subagent::SubagentManager;
use countbot_bus::{MessageBus, RateLimiter};
use countbot_channels::{ChannelMessageHandler, ChannelSupervisor};
use countbot_core::config::CountBotConfig;
use countbot_cron::{CronService, HeartbeatService, Scheduler};
use countbot_memory::MemoryStore;
use countbot_sessions::SessionManager;
use countbot_settings::{PersonalityStore, SettingsStore};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: RwLock<CountBotConfig>,
    pub bus: Arc<MessageBus>,
    pub rate_limiter: Arc<RateLimiter>,
    pub memory: Arc<MemoryStore>,
    pub sessions: Arc<SessionManager>,
    pub settings: SettingsStore,
    pub personalities: PersonalityStore,
    pub agent: Arc<AgentLoop>,
    pub subagents: Arc<SubagentManager>,
    pub handler: Arc<ChannelMessageHandler>,
    pub cron: Arc<CronService>,
    pub heartbeat: Arc<HeartbeatService>,
    pub scheduler: Arc<Scheduler>,
    pub supervisor: Arc<ChannelSupervisor>,
    /// Session tokens issued by /api/auth/login.
    pub auth_tokens: DashMap<String, String>,
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(crate::http::health::health))
        // Queue
        .route("/api/queue/stats", get(crate::http::queue::stats))
        .route("/api/queue/cancel", post(crate::http::queue::cancel))
        .route("/api/queue/active-tasks", get(crate::http::queue::active_tasks))
        // Cron
        .route("/api/cron/jobs", get(crate::http::cron::list_jobs))
        .route("/api/cron/jobs", post(crate::http::cron::create_job))
        .route("/api/cron/jobs/{id}", get(crate::http::cron::get_job))
        .route("/api/cron/jobs/{id}", put(crate::http::cron::update_job))
        .route("/api/cron/jobs/{id}", delete(crate::http::cron::delete_job))
        .route("/api/cron/jobs/{id}/run", post(crate::http::cron::run_job))
        .route("/api/cron/validate", post(crate::http::cron::validate))
        // Channels
        .route("/api/channels/list", get(crate::http::channels::list))
        .route("/api/channels/status", get(crate::http::channels::status))
        .route("/api/channels/test", post(crate::http::channels::test))
        .route("/api/channels/update", post(crate::http::channels::update))
        .route(
            "/api/channels/{channel}/config",
            get(crate::http::channels::get_config),
        )
        // Settings
        .route("/api/settings", get(crate::http::settings::get_settings))
        .route("/api/settings", put(crate::http::settings::put_settings))
        .route(
            "/api/settings/test-connection",
            post(crate::http::settings::test_connection),
        )
        .route("/api/settings/providers", get(crate::http::settings::providers))
        .route(
            "/api/settings/security/dangerous-patterns",
            get(crate::http::settings::dangerous_patterns),
        )
        // Personalities
        .route(
            "/api/personalities",
            get(crate::http::settings::list_personalities),
        )
        .route(
            "/api/personalities/{id}",
            delete(crate::http::settings::delete_personality),
        )
        // Tasks
        .route("/api/tasks", get(crate::http::tasks::list))
        .route("/api/tasks/stats", get(crate::http::tasks::stats))
        .route("/api/tasks/{id}", get(crate::http::tasks::get))
        .route("/api/tasks/{id}", delete(crate::http::tasks::cancel))
        .route("/api/tasks/{id}/delete", post(crate::http::tasks::remove))
        // Auth
        .route("/api/auth/login", post(crate::auth::login))
        .route("/api/auth/logout", post(crate::auth::logout))
        // WebSocket chat
        .route("/ws", get(crate::ws::connection::ws_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::auth_middleware,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
