//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core error: {0}")]
    Core(#[from] convflow_core::CoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns the error code sent back to clients.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::Io(_) => "INTERNAL_ERROR",
            ServerError::Core(e) => e.error_code(),
            ServerError::Json(_) => "BAD_REQUEST",
            ServerError::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServerError::Io(_) | ServerError::ShuttingDown)
    }
}
