//! Error types for the Ruby agent

use axum::http::StatusCode;
use thiserror::Error;

/// Main error type for the Ruby agent
#[derive(Error, Debug)]
pub enum AgentError {
    /// The referenced session id is not registered
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Failure inside the AI backend, either at initialization or mid-stream
    #[error("Provider error: {0}")]
    Provider(String),

    /// Malformed or unexpected frame, or a request that violates the stream protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A confirmation response named an id that is unknown or already settled
    #[error("confirmation not found or expired: {0}")]
    ConfirmationNotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Registry failures such as duplicate ids or poisoned locks
    #[error("Session error: {0}")]
    Session(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The server ended a stream with an `error` frame
    #[error("Stream error: {0}")]
    Stream(String),

    /// The control plane answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl AgentError {
    /// Convert agent error to the HTTP status reported by the control plane
    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::ConfirmationNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Protocol(_) => StatusCode::BAD_REQUEST,
            AgentError::Serialization(_) => StatusCode::BAD_REQUEST,
            AgentError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AgentError::Http { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in `error` frames and `{error}` response bodies
    ///
    /// Not-found conditions use the bare wording clients match on.
    pub fn client_message(&self) -> String {
        match self {
            AgentError::SessionNotFound(_) => "session not found".to_string(),
            AgentError::ConfirmationNotFound(_) => "confirmation not found or expired".to_string(),
            AgentError::Provider(message) | AgentError::Stream(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Convenience type alias for Results using AgentError
pub type Result<T> = std::result::Result<T, AgentError>;
