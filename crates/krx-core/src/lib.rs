//! Core domain types for the KRX slot trader.
//!
//! This crate provides fundamental types used throughout the trading system:
//! - `Ticker`: Six-digit KRX instrument code
//! - `Price`: Precision-safe KRW price
//! - `tick_size` / `safe_price`: Exchange price increment table
//! - `Session`: Persisted record of one managed holding
//! - `OrderAttempt`, `PlacedOrder`, `FillStatus`, `Holding`: Broker-facing records
//! - `TradingWindow`: Daily window during which exits may act

pub mod decimal;
pub mod error;
pub mod market;
pub mod market_hours;
pub mod order;
pub mod session;
pub mod tick;

use std::future::Future;
use std::pin::Pin;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use decimal::Price;
pub use error::{CoreError, Result};
pub use market::Ticker;
pub use market_hours::{kst_now, to_kst, TradingWindow, KST_OFFSET_SECS};
pub use order::{
    average_fill_price, filled_total, ExitReason, FillStatus, Holding, OpenOrder, OrderAttempt,
    OrderId, OrderSide, PlaceStatus, PlacedOrder,
};
pub use session::{Session, SessionId};
pub use tick::{safe_price, tick_size};
