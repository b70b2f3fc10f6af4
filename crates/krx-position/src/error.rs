//! Position error types.

use krx_executor::ExecutorError;
use krx_persistence::PersistenceError;
use krx_ws::WsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Lock for {ticker} not acquired within {timeout_ms}ms")]
    LockTimeout { ticker: String, timeout_ms: u64 },

    #[error("Holding check for {ticker} failed after {attempts} attempts: {source}")]
    HoldingCheck {
        ticker: String,
        attempts: u32,
        #[source]
        source: ExecutorError,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Ws(#[from] WsError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type PositionResult<T> = Result<T, PositionError>;
