use thiserror::Error;

#[derive(Debug, Error)]
pub enum CountBotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Quota or balance exhausted: {0}")]
    QuotaExhausted(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Context too long: {0}")]
    ContextTooLong(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Tool error: {0}")]
    ToolError(String),

    #[error("Channel unavailable ({channel}): {reason}")]
    ChannelUnavailable { channel: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CountBotError {
    /// Short error code string surfaced to WS clients and REST bodies.
    pub fn code(&self) -> &'static str {
        match self {
            CountBotError::Config(_) => "CONFIG_ERROR",
            CountBotError::InvalidInput(_) => "INVALID_INPUT",
            CountBotError::NotFound(_) => "NOT_FOUND",
            CountBotError::Forbidden(_) => "FORBIDDEN",
            CountBotError::AuthFailed(_) => "AUTH_FAILED",
            CountBotError::RateLimited(_) => "RATE_LIMITED",
            CountBotError::QuotaExhausted(_) => "QUOTA_EXHAUSTED",
            CountBotError::ModelUnavailable(_) => "MODEL_UNAVAILABLE",
            CountBotError::ContextTooLong(_) => "CONTEXT_TOO_LONG",
            CountBotError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            CountBotError::NetworkError(_) => "NETWORK_ERROR",
            CountBotError::ToolError(_) => "TOOL_ERROR",
            CountBotError::ChannelUnavailable { .. } => "CHANNEL_UNAVAILABLE",
            CountBotError::Cancelled => "CANCELLED",
            CountBotError::Database(_) => "DATABASE_ERROR",
            CountBotError::Serialization(_) => "SERIALIZATION_ERROR",
            CountBotError::Io(_) => "IO_ERROR",
            CountBotError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the REST edge maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            CountBotError::InvalidInput(_) => 400,
            CountBotError::AuthFailed(_) => 401,
            CountBotError::Forbidden(_) => 403,
            CountBotError::NotFound(_) => 404,
            CountBotError::RateLimited(_) => 429,
            CountBotError::ServiceUnavailable(_) | CountBotError::ChannelUnavailable { .. } => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, CountBotError>;
