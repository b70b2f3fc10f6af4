//! KRX slot trader.
//!
//! Main application that orchestrates all components:
//! - Streaming quote connection with subscription restore
//! - Per-position exit monitors (profit, stop-loss, holding-period expiry)
//! - Fill reconciliation through one shared broker handle
//! - Session persistence and trade journal

pub mod app;
pub mod config;
pub mod error;

pub use app::{Application, RunSummary, Services};
pub use config::AppConfig;
pub use error::{AppError, AppResult};
