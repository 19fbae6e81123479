// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Hard failures only. Order rejections are data (`domain::Rejection`), not errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Upstream quote provider failure; absorbed by the router, never surfaced to callers.
    #[error("provider {provider} failed: {message}")]
    Provider { provider: &'static str, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn provider(provider: &'static str, message: impl Into<String>) -> Self {
        Error::Provider { provider, message: message.into() }
    }

    /// Whether the caller sent something malformed (4xx) rather than the system failing (5xx).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidInput(_))
    }
}

