//! Core error types.

use thiserror::Error;

/// Errors from flow construction and loading.
///
/// Dispatch outcomes such as a message that matches no rule are not errors;
/// they are reported through [`crate::runtime::DispatchResult`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid builder state: {reason}")]
    InvalidBuilderState { reason: String },

    #[error("invalid guard pattern '{pattern}': {reason}")]
    InvalidGuard { pattern: String, reason: String },

    #[error("invalid flow: {reason}")]
    InvalidFlow { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    /// Returns an error code suitable for transport responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidBuilderState { .. } => "INVALID_BUILDER_STATE",
            CoreError::InvalidGuard { .. } => "BAD_REQUEST",
            CoreError::InvalidFlow { .. } => "BAD_REQUEST",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::Json(_) => "BAD_REQUEST",
            CoreError::Yaml(_) => "BAD_REQUEST",
        }
    }
}
