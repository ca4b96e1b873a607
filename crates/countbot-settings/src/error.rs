use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("builtin personality cannot be deleted: {0}")]
    BuiltinProtected(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;
