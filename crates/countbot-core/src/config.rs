use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Top-level config (countbot.toml + COUNTBOT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CountBotConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Salted SHA-256 hex digest of the login password. Empty disables login
    /// (loopback-only access).
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub password_salt: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            password_hash: String::new(),
            password_salt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// LLM call parameters. `provider` names an entry in the provider registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// 0 means "let the model decide" — the parameter is omitted from requests.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_iterations: default_max_iterations(),
        }
    }
}

/// A configured LLM provider (api key + optional base url override).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    #[serde(default)]
    pub api_key: String,
    pub api_base: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkspaceConfig {
    /// Root directory the file tools and memory store operate under.
    /// Empty means `~/.countbot/workspace`.
    #[serde(default)]
    pub path: String,
}

impl WorkspaceConfig {
    pub fn resolve(&self) -> std::path::PathBuf {
        if self.path.is_empty() {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            std::path::PathBuf::from(home).join(".countbot/workspace")
        } else {
            std::path::PathBuf::from(&self.path)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "bool_true")]
    pub dangerous_commands_blocked: bool,
    #[serde(default)]
    pub custom_deny_patterns: Vec<String>,
    #[serde(default)]
    pub command_whitelist_enabled: bool,
    #[serde(default)]
    pub custom_allow_patterns: Vec<String>,
    #[serde(default = "bool_true")]
    pub audit_log_enabled: bool,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    #[serde(default = "default_max_output_length")]
    pub max_output_length: usize,
    #[serde(default)]
    pub restrict_to_workspace: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            dangerous_commands_blocked: true,
            custom_deny_patterns: Vec::new(),
            command_whitelist_enabled: false,
            custom_allow_patterns: Vec::new(),
            audit_log_enabled: true,
            command_timeout: default_command_timeout(),
            max_output_length: default_max_output_length(),
            restrict_to_workspace: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Channel configs — a closed set, one struct per transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub qq: QqConfig,
    #[serde(default)]
    pub wechat: WeChatConfig,
    #[serde(default)]
    pub dingtalk: DingTalkConfig,
    #[serde(default)]
    pub feishu: FeishuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    /// Optional outbound HTTP proxy URL.
    pub proxy: Option<String>,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QqConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub allow_from: Vec<String>,
    #[serde(default = "bool_true")]
    pub markdown_enabled: bool,
    #[serde(default = "bool_true")]
    pub group_markdown_enabled: bool,
}

impl Default for QqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_id: String::new(),
            secret: String::new(),
            allow_from: Vec::new(),
            markdown_enabled: true,
            group_markdown_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WeChatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DingTalkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeishuConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

// ---------------------------------------------------------------------------
// Persona / heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_ai_name")]
    pub ai_name: String,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default)]
    pub user_address: String,
    #[serde(default = "default_personality")]
    pub personality: String,
    #[serde(default)]
    pub custom_personality: String,
    /// -1 means unlimited history.
    #[serde(default = "default_max_history")]
    pub max_history_messages: i64,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            ai_name: default_ai_name(),
            user_name: default_user_name(),
            user_address: String::new(),
            personality: default_personality(),
            custom_personality: String::new(),
            max_history_messages: default_max_history(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default = "default_heartbeat_schedule")]
    pub schedule: String,
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_hours: u32,
    #[serde(default = "default_quiet_start")]
    pub quiet_start: u32,
    #[serde(default = "default_quiet_end")]
    pub quiet_end: u32,
    #[serde(default = "default_max_greets")]
    pub max_greets_per_day: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: String::new(),
            chat_id: String::new(),
            schedule: default_heartbeat_schedule(),
            idle_threshold_hours: default_idle_threshold(),
            quiet_start: default_quiet_start(),
            quiet_end: default_quiet_end(),
            max_greets_per_day: default_max_greets(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue / rate limiting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub enable_persistence: bool,
    /// Directory for `{uuid}.json` persistence files. Empty means
    /// `<workspace>/queue`.
    #[serde(default)]
    pub persist_dir: String,
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_rate")]
    pub rate_limit: u32,
    #[serde(default = "default_rate_per")]
    pub rate_limit_per_secs: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enable_persistence: false,
            persist_dir: String::new(),
            dedup_window_secs: default_dedup_window(),
            rate_limit: default_rate(),
            rate_limit_per_secs: default_rate_per(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn bool_true() -> bool {
    true
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.countbot/countbot.db", home)
}
fn default_provider() -> String {
    "zhipu".to_string()
}
fn default_model() -> String {
    "glm-4-flash".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_iterations() -> u32 {
    25
}
fn default_command_timeout() -> u64 {
    60
}
fn default_max_output_length() -> usize {
    10_000
}
fn default_ai_name() -> String {
    "小C".to_string()
}
fn default_user_name() -> String {
    "主人".to_string()
}
fn default_personality() -> String {
    "professional".to_string()
}
fn default_max_history() -> i64 {
    100
}
fn default_heartbeat_schedule() -> String {
    "0 * * * *".to_string()
}
fn default_idle_threshold() -> u32 {
    4
}
fn default_quiet_start() -> u32 {
    21
}
fn default_quiet_end() -> u32 {
    8
}
fn default_max_greets() -> u32 {
    2
}
fn default_dedup_window() -> u64 {
    60
}
fn default_rate() -> u32 {
    10
}
fn default_rate_per() -> u32 {
    60
}

impl CountBotConfig {
    /// Load config from a TOML file with COUNTBOT_* env var overrides.
    ///
    /// Checks in order: explicit path argument, then
    /// `~/.countbot/countbot.toml`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CountBotConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("COUNTBOT_").split("_"))
            .extract()
            .map_err(|e| crate::error::CountBotError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Api key + base url for the active provider entry, if configured.
    pub fn active_provider(&self) -> Option<&ProviderEntry> {
        self.providers
            .iter()
            .find(|p| p.id == self.model.provider && p.enabled)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.countbot/countbot.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CountBotConfig::default();
        assert_eq!(cfg.gateway.port, 8000);
        assert_eq!(cfg.gateway.host, "127.0.0.1");
        assert_eq!(cfg.model.max_iterations, 25);
        assert!(cfg.security.dangerous_commands_blocked);
        assert_eq!(cfg.queue.dedup_window_secs, 60);
        assert!(!cfg.channels.telegram.enabled);
    }

    #[test]
    fn heartbeat_defaults_match_builtin_job() {
        let hb = HeartbeatConfig::default();
        assert_eq!(hb.schedule, "0 * * * *");
        assert_eq!(hb.quiet_start, 21);
        assert_eq!(hb.quiet_end, 8);
        assert_eq!(hb.max_greets_per_day, 2);
    }
}
