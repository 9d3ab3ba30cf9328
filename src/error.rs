//! Session error taxonomy

use thiserror::Error;

use crate::inference::backend::EngineError;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced by session lifecycle and generation calls
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Load error: {0}")]
    Load(EngineError),

    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to tokenize prompt: {0}")]
    Tokenize(EngineError),

    #[error("Prompt evaluation failed: {0}")]
    Prefill(EngineError),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Session worker error: {0}")]
    Worker(String),
}

impl SessionError {
    /// Load failures and bad load arguments
    pub fn is_load_failure(&self) -> bool {
        matches!(self, SessionError::Load(_) | SessionError::InvalidParameter(_))
    }
}
