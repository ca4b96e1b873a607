use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use countbot_agent::agent_loop::{AgentLoop, LoopParams};
use countbot_agent::openai::OpenAiClient;
use countbot_agent::prompt::ContextBuilder;
use countbot_agent::provider::LlmProvider;
use countbot_agent::subagent::SubagentManager;
use countbot_agent::tools::{
    edit_file::EditFileTool, exec_shell::ExecShellTool, list_dir::ListDirTool,
    memory_tools::{MemoryAppendTool, MemoryDeleteTool, MemoryReadTool, MemorySearchTool},
    read_file::ReadFileTool, send_media::SendMediaTool, subagent_tool::SpawnSubagentTool,
    web::{WebFetchTool, WebSearchTool}, write_file::WriteFileTool, ToolRegistry,
};
use countbot_bus::{MessageBus, RateLimiter};
use countbot_channels::{
    dingtalk::DingTalkAdapter, discord::DiscordAdapter, feishu::FeishuAdapter, qq::QqAdapter,
    telegram::TelegramAdapter, wechat::WeChatAdapter, ChannelMessageHandler, ChannelSupervisor,
};
use countbot_core::config::CountBotConfig;
use countbot_cron::scheduler::{DEFAULT_JOB_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENT};
use countbot_cron::{CronExecutor, CronService, HeartbeatService, Scheduler};
use countbot_memory::MemoryStore;
use countbot_sessions::SessionManager;
use countbot_settings::{PersonalityStore, SettingsStore};

mod app;
mod auth;
mod http;
mod pidfile;
mod ws;

/// Subagent turns are capped well below the main loop.
const SUBAGENT_MAX_ITERATIONS: u32 = 15;

#[derive(Parser)]
#[command(name = "countbot-gateway", about = "CountBot assistant gateway")]
struct Cli {
    /// Path to countbot.toml (defaults to ~/.countbot/countbot.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "countbot_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = CountBotConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        CountBotConfig::default()
    });

    // HOST/PORT env override the file, matching container conventions.
    if let Ok(host) = std::env::var("HOST") {
        config.gateway.host = host;
    }
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(port) = port.parse() {
            config.gateway.port = port;
        }
    }

    let workspace = config.workspace.resolve();
    std::fs::create_dir_all(&workspace)?;

    let pidfile = pidfile::PidFile::acquire(&workspace.join("countbot.pid"))?;

    // --- storage ------------------------------------------------------------
    let db_path = config.database.path.clone();
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let sessions = {
        let conn = rusqlite::Connection::open(&db_path)?;
        countbot_sessions::db::init_db(&conn)?;
        Arc::new(SessionManager::new(conn))
    };
    let settings = {
        let conn = rusqlite::Connection::open(&db_path)?;
        countbot_settings::db::init_db(&conn)?;
        SettingsStore::new(conn)
    };
    let personalities = {
        let conn = rusqlite::Connection::open(&db_path)?;
        countbot_settings::db::init_db(&conn)?;
        let store = PersonalityStore::new(conn);
        store.seed_builtins()?;
        store
    };
    let cron = {
        let conn = rusqlite::Connection::open(&db_path)?;
        countbot_cron::db::init_db(&conn)?;
        Arc::new(CronService::new(conn))
    };

    let memory = Arc::new(MemoryStore::new(&workspace.join("memory"))?);

    // --- bus ----------------------------------------------------------------
    let persist_dir = if config.queue.persist_dir.is_empty() {
        workspace.join("queue")
    } else {
        std::path::PathBuf::from(&config.queue.persist_dir)
    };
    let bus = Arc::new(MessageBus::new(
        Some(persist_dir),
        config.queue.enable_persistence,
        config.queue.dedup_window_secs,
    ));
    let rate_limiter = Arc::new(RateLimiter::new(
        config.queue.rate_limit,
        config.queue.rate_limit_per_secs,
    ));

    // --- agent --------------------------------------------------------------
    let provider: Arc<dyn LlmProvider> = match config.active_provider() {
        Some(entry) => Arc::new(OpenAiClient::new(
            &entry.id,
            entry.api_key.clone(),
            entry.api_base.clone(),
        )),
        None => {
            warn!("no enabled provider configured; LLM calls will fail until settings are saved");
            Arc::new(OpenAiClient::new(&config.model.provider, String::new(), None))
        }
    };

    let context = Arc::new(ContextBuilder::new(
        config.persona.clone(),
        Arc::clone(&memory),
        workspace.clone(),
    ));
    let security = Arc::new(RwLock::new(config.security.clone()));

    let mut base_tools = ToolRegistry::new();
    let restrict = config.security.restrict_to_workspace;
    base_tools.register(Arc::new(ReadFileTool::new(workspace.clone(), restrict)));
    base_tools.register(Arc::new(WriteFileTool::new(workspace.clone(), restrict)));
    base_tools.register(Arc::new(EditFileTool::new(workspace.clone(), restrict)));
    base_tools.register(Arc::new(ListDirTool::new(workspace.clone(), restrict)));
    base_tools.register(Arc::new(ExecShellTool::new(
        workspace.clone(),
        Arc::clone(&security),
    )));
    base_tools.register(Arc::new(WebSearchTool::new()));
    base_tools.register(Arc::new(WebFetchTool::new()));
    base_tools.register(Arc::new(MemoryAppendTool::new(
        Arc::clone(&memory),
        "web-chat",
    )));
    base_tools.register(Arc::new(MemoryReadTool::new(Arc::clone(&memory))));
    base_tools.register(Arc::new(MemorySearchTool::new(Arc::clone(&memory))));
    base_tools.register(Arc::new(MemoryDeleteTool::new(Arc::clone(&memory))));

    let loop_params = LoopParams {
        model: config.model.model.clone(),
        temperature: config.model.temperature,
        max_tokens: config.model.max_tokens,
        max_iterations: config.model.max_iterations,
    };

    // Restricted loop for subagents: same tools minus channel sends, capped
    // iterations. Built first so the spawn tool can reference the manager.
    let restricted_loop = Arc::new(AgentLoop::new(
        Arc::clone(&provider),
        base_tools.clone(),
        Arc::clone(&context),
        LoopParams {
            max_iterations: SUBAGENT_MAX_ITERATIONS,
            ..loop_params.clone()
        },
    ));
    let subagents = Arc::new(SubagentManager::new(Arc::clone(&restricted_loop)));

    let mut full_tools = base_tools;
    full_tools.register(Arc::new(SendMediaTool::new(Arc::clone(&bus))));
    full_tools.register(Arc::new(SpawnSubagentTool::new(Arc::clone(&subagents))));

    let agent = Arc::new(AgentLoop::new(
        Arc::clone(&provider),
        full_tools,
        Arc::clone(&context),
        loop_params,
    ));

    // --- handler + channels -------------------------------------------------
    let handler = Arc::new(ChannelMessageHandler::new(
        Arc::clone(&bus),
        Some(Arc::clone(&rate_limiter)),
        Arc::clone(&sessions),
        Arc::clone(&memory),
        Arc::clone(&agent),
        config.persona.max_history_messages,
    ));

    let mut supervisor = ChannelSupervisor::new(Arc::clone(&bus));
    register_channels(&mut supervisor, &config, &handler);
    let supervisor = Arc::new(supervisor);

    // --- cron ---------------------------------------------------------------
    let heartbeat = Arc::new(HeartbeatService::new(
        Arc::clone(&agent),
        Arc::clone(&sessions),
        Arc::clone(&memory),
        config.persona.heartbeat.clone(),
    ));
    if let Err(e) = cron.ensure_heartbeat_job(&config.persona.heartbeat) {
        warn!("failed to sync builtin heartbeat job: {e}");
    }
    let executor = Arc::new(CronExecutor::new(
        Arc::clone(&agent),
        Arc::clone(&bus),
        Arc::clone(&sessions),
        Some(Arc::clone(&heartbeat)),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&cron),
        executor,
        DEFAULT_MAX_CONCURRENT,
        Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
    ));
    scheduler.start();

    // --- run ----------------------------------------------------------------
    tokio::spawn(Arc::clone(&handler).start_processing());
    supervisor.start_all();

    let state = Arc::new(app::AppState {
        config: RwLock::new(config.clone()),
        bus,
        rate_limiter,
        memory,
        sessions,
        settings,
        personalities,
        agent,
        subagents,
        handler,
        cron,
        heartbeat,
        scheduler: Arc::clone(&scheduler),
        supervisor: Arc::clone(&supervisor),
        auth_tokens: dashmap::DashMap::new(),
    });
    let router = app::build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port).parse()?;
    info!("countbot gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutting down");
    supervisor.stop_all().await;
    scheduler.stop().await;
    pidfile.release();
    Ok(())
}

/// Build and register every enabled adapter, wiring the handler callback.
fn register_channels(
    supervisor: &mut ChannelSupervisor,
    config: &CountBotConfig,
    handler: &Arc<ChannelMessageHandler>,
) {
    let callback = handler.inbound_callback();
    let mut register = |result: Result<
        Arc<dyn countbot_channels::Channel>,
        countbot_channels::ChannelError,
    >,
                        name: &str| match result {
        Ok(channel) => {
            channel.set_message_callback(callback.clone());
            supervisor.register(channel);
        }
        Err(e) => warn!(channel = name, "adapter not registered: {e}"),
    };

    let channels = &config.channels;
    if channels.telegram.enabled {
        register(
            TelegramAdapter::new(&channels.telegram).map(|a| Arc::new(a) as _),
            "telegram",
        );
    }
    if channels.discord.enabled {
        register(
            DiscordAdapter::new(&channels.discord).map(|a| Arc::new(a) as _),
            "discord",
        );
    }
    if channels.qq.enabled {
        register(QqAdapter::new(&channels.qq).map(|a| Arc::new(a) as _), "qq");
    }
    if channels.wechat.enabled {
        register(
            WeChatAdapter::new(&channels.wechat).map(|a| Arc::new(a) as _),
            "wechat",
        );
    }
    if channels.dingtalk.enabled {
        register(
            DingTalkAdapter::new(&channels.dingtalk).map(|a| Arc::new(a) as _),
            "dingtalk",
        );
    }
    if channels.feishu.enabled {
        register(
            FeishuAdapter::new(&channels.feishu).map(|a| Arc::new(a) as _),
            "feishu",
        );
    }
}

/// Resolve on SIGINT, SIGTERM, or SIGHUP.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = sighup.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
