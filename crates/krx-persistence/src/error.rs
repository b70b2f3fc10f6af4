//! Persistence error types.

use krx_core::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session already exists for ticker {0}")]
    DuplicateTicker(String),

    #[error("Invalid session: {0}")]
    Invalid(#[from] krx_core::CoreError),
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
