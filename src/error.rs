//! Error types for the agent core

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the agent core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The provider rejected the token-limit parameter name for this model.
    #[error("Token parameter rejected: {0}")]
    TokenParameter(String),

    #[error("Call failed after {attempts} attempt(s). Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Tool '{name}' not found in registry. Available tools: {available:?}")]
    ToolNotFound { name: String, available: Vec<String> },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a retry with backoff can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::RateLimited(_) | Error::Connection(_) | Error::Timeout(_) => true,
            Error::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
