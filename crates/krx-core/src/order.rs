//! Order-related types and broker-facing records.
//!
//! Every quantity is a whole number of shares (`u64`). Prices are limit
//! prices in won.

use crate::decimal::Price;
use crate::market::Ticker;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Broker-assigned order number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome class of a placement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceStatus {
    /// Order accepted; `order_id` is set.
    Accepted,
    /// Broker throttled the request. Safe to retry immediately.
    RateLimited,
    /// Broker refused the order.
    Rejected,
}

impl fmt::Display for PlaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Broker reply to a placement request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub status: PlaceStatus,
    pub order_id: Option<OrderId>,
    pub message: String,
}

impl PlacedOrder {
    pub fn accepted(order_id: OrderId) -> Self {
        Self {
            status: PlaceStatus::Accepted,
            order_id: Some(order_id),
            message: String::new(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: PlaceStatus::Rejected,
            order_id: None,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            status: PlaceStatus::RateLimited,
            order_id: None,
            message: message.into(),
        }
    }

    /// Order id of an accepted placement.
    pub fn accepted_id(&self) -> Option<&OrderId> {
        match self.status {
            PlaceStatus::Accepted => self.order_id.as_ref(),
            _ => None,
        }
    }
}

/// Cumulative fill state of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillStatus {
    pub filled: u64,
    pub remaining: u64,
}

/// A position as the broker reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub ticker: Ticker,
    pub quantity: u64,
    pub avg_price: Price,
}

/// A working order as the broker reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: OrderId,
    pub ticker: Ticker,
    pub side: OrderSide,
    pub remaining: u64,
}

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    /// Holding period over.
    Expired,
    Profit,
    StopLoss,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Profit => "profit",
            Self::StopLoss => "stop-loss",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One leg of an execution: a single broker order and what it filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAttempt {
    pub ticker: Ticker,
    pub order_id: OrderId,
    pub side: OrderSide,
    pub price: Price,
    pub requested: u64,
    pub filled: u64,
    pub remaining: u64,
    pub status: PlaceStatus,
    pub message: String,
}

/// Executed quantity across an ordered attempt list.
#[must_use]
pub fn filled_total(attempts: &[OrderAttempt]) -> u64 {
    attempts.iter().map(|a| a.filled).sum()
}

/// Quantity-weighted average fill price, or `None` when nothing filled.
#[must_use]
pub fn average_fill_price(attempts: &[OrderAttempt]) -> Option<Price> {
    let filled = filled_total(attempts);
    if filled == 0 {
        return None;
    }
    let notional: rust_decimal::Decimal = attempts.iter().map(|a| a.price.notional(a.filled)).sum();
    Some(Price::new(notional / rust_decimal::Decimal::from(filled)))
}
