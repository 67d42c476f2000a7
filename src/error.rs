//! Error types for llm-relay
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur while streaming from a provider or running the agent loop
#[derive(Debug, Error)]
pub enum RelayError {
    /// Request or message rejected before dispatch
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Malformed wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport ended before the provider signalled completion
    #[error("Unexpected end of stream: {0}")]
    UnexpectedEof(String),

    /// Error reported in-band by the provider mid-stream
    #[error("Provider error ({kind}): {message}")]
    Provider { kind: String, message: String },

    /// The provider refused the prompt outright
    #[error("Prompt blocked: {0}")]
    Blocked(String),

    /// Non-success HTTP status from the provider
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Network or transport read failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cooperative cancellation was observed
    #[error("Operation cancelled")]
    Cancelled,

    /// `Stream::message` called before any data arrived
    #[error("No data received yet")]
    NoData,

    /// The agent loop hit its configured turn bound
    #[error("Turn limit of {0} reached")]
    TurnLimit(u32),

    /// Missing API key in the environment
    #[error("Missing API key: environment variable {0} not set")]
    MissingApiKey(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    /// Malformed data, unexpected termination, or an in-band provider error
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            RelayError::Protocol(_)
                | RelayError::UnexpectedEof(_)
                | RelayError::Provider { .. }
                | RelayError::Blocked(_)
                | RelayError::Json(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled)
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

/// Result type alias for llm-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
