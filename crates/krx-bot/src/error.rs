//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] krx_ws::WsError),

    #[error("Executor error: {0}")]
    Executor(#[from] krx_executor::ExecutorError),

    #[error("Position error: {0}")]
    Position(#[from] krx_position::PositionError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] krx_telemetry::TelemetryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] krx_persistence::PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
