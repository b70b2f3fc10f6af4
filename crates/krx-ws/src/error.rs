//! WebSocket error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connect timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("No frames for {0}ms, socket presumed dead")]
    IdleTimeout(u64),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Ticker not registered: {0}")]
    NotRegistered(String),

    #[error("Client stopped")]
    ChannelClosed,

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WsError {
    /// Errors that mean the approval key is no longer valid.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Credential(_))
    }
}

pub type WsResult<T> = Result<T, WsError>;
