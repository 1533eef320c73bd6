//! Error types for the sandbox HTTP server.

use sandbox_core::{QueueError, ValidationError};
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Body is not a well-formed execution request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request broke a submission limit
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Broker or job failure
    #[error("{0}")]
    Queue(#[from] QueueError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<sandbox_core::ConfigError> for ServerError {
    fn from(e: sandbox_core::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

/// Convert ServerError to HTTP status code
impl ServerError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) | ServerError::Validation(_) | ServerError::Json(_) => {
                400
            }
            ServerError::Queue(QueueError::Validation(_)) => 400,
            ServerError::Queue(_)
            | ServerError::Io(_)
            | ServerError::Config(_)
            | ServerError::Internal(_) => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::InvalidRequest(_) => "invalid_request",
            ServerError::Validation(_) | ServerError::Queue(QueueError::Validation(_)) => {
                "validation_error"
            }
            ServerError::Queue(QueueError::WaitTimeout(_)) => "wait_timeout",
            ServerError::Queue(QueueError::JobFailed(_)) => "job_failed",
            ServerError::Queue(_) => "queue_error",
            ServerError::Json(_) => "json_error",
            ServerError::Io(_) => "io_error",
            ServerError::Config(_) => "config_error",
            ServerError::Internal(_) => "internal_error",
        }
    }

    /// Whether the fault lies with the request rather than the service.
    pub fn is_client_error(&self) -> bool {
        self.status_code() == 400
    }
}
