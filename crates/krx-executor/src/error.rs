//! Executor error types.

use krx_core::{CoreError, OrderAttempt};
use krx_persistence::PersistenceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Broker call failed: {0}")]
    Broker(String),

    /// The broker refused a placement. `attempts` holds every leg recorded
    /// before the refusal, filled quantities included.
    #[error("Order rejected for {ticker}: {message}")]
    OrderRejected {
        ticker: String,
        message: String,
        attempts: Vec<OrderAttempt>,
    },

    #[error("Rate limit retries exhausted for {ticker} after {retries} retries")]
    RateLimitExhausted { ticker: String, retries: u32 },

    #[error("Fill reconciliation for {ticker} gave up after {rounds} rounds")]
    ReconcileExhausted {
        ticker: String,
        rounds: usize,
        attempts: Vec<OrderAttempt>,
    },

    /// A broker call failed partway through fill reconciliation. `attempts`
    /// holds the legs recorded before the failure; the state of the last
    /// working order is unknown.
    #[error("Fill reconciliation for {ticker} interrupted: {source}")]
    Interrupted {
        ticker: String,
        source: Box<ExecutorError>,
        attempts: Vec<OrderAttempt>,
    },

    #[error("Worker pool task failed: {0}")]
    Worker(String),

    #[error("Broker handle closed")]
    Closed,

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Session store error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ExecutorError {
    /// Legs recorded before the failure. Empty for errors raised before any
    /// order was placed.
    pub fn attempts(&self) -> &[OrderAttempt] {
        match self {
            Self::OrderRejected { attempts, .. }
            | Self::ReconcileExhausted { attempts, .. }
            | Self::Interrupted { attempts, .. } => attempts,
            _ => &[],
        }
    }

    /// The underlying failure of an interrupted reconciliation, `self`
    /// otherwise.
    pub fn cause(&self) -> &ExecutorError {
        match self {
            Self::Interrupted { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Needs manual follow-up: a retry ceiling was hit, or an order was left
    /// in an unknown state.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExhausted { .. }
                | Self::ReconcileExhausted { .. }
                | Self::Interrupted { .. }
        )
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
