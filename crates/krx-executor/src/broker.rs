//! Broker abstraction and the shared broker handle.
//!
//! One account, one rate limit: every component that talks to the broker
//! goes through a single [`BrokerHandle`]. The handle owns the global
//! semaphore, so each broker call holds a permit for its duration no matter
//! which monitor or executor issued it.

use crate::error::{ExecutorError, ExecutorResult};
use krx_core::{
    BoxFuture, FillStatus, Holding, OpenOrder, OrderId, OrderSide, PlaceStatus, PlacedOrder,
    Price, Ticker,
};
use krx_telemetry::Metrics;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// Message fragments brokers use for per-second quota rejections.
const RATE_LIMIT_MARKERS: &[&str] = &["초당 거래건수", "EGW00201", "rate limit", "Too Many Requests"];

/// Classify a broker refusal message.
///
/// Broker implementations that only see a free-text rejection use this to
/// decide between `RateLimited` and `Rejected`.
pub fn classify_rejection(message: &str) -> PlaceStatus {
    if RATE_LIMIT_MARKERS.iter().any(|m| message.contains(m)) {
        PlaceStatus::RateLimited
    } else {
        PlaceStatus::Rejected
    }
}

// ============================================================================
// Broker trait
// ============================================================================

/// Order and account interface of the brokerage.
pub trait Broker: Send + Sync {
    /// Place an order. `price = None` is a market order.
    fn place_order<'a>(
        &'a self,
        ticker: &'a Ticker,
        quantity: u64,
        side: OrderSide,
        price: Option<Price>,
    ) -> BoxFuture<'a, ExecutorResult<PlacedOrder>>;

    fn cancel_order<'a>(&'a self, order_id: &'a OrderId) -> BoxFuture<'a, ExecutorResult<()>>;

    /// Cumulative fill state of an order.
    fn query_fill<'a>(&'a self, order_id: &'a OrderId)
        -> BoxFuture<'a, ExecutorResult<FillStatus>>;

    fn get_holdings(&self) -> BoxFuture<'_, ExecutorResult<Vec<Holding>>>;

    fn get_available_cash(&self) -> BoxFuture<'_, ExecutorResult<Decimal>>;

    /// Working orders for one ticker.
    fn open_orders<'a>(&'a self, ticker: &'a Ticker)
        -> BoxFuture<'a, ExecutorResult<Vec<OpenOrder>>>;
}

/// Arc wrapper for Broker trait objects.
pub type DynBroker = Arc<dyn Broker>;

// ============================================================================
// BrokerHandle
// ============================================================================

/// Broker handle limits.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Concurrent broker calls across the whole process.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// Immediate retries of a rate-limited placement before giving up.
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
}

fn default_max_concurrent_calls() -> usize {
    1
}

fn default_max_rate_limit_retries() -> u32 {
    20
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent_calls(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
        }
    }
}

/// The single shared broker client.
///
/// Cheap to clone; clones share the broker and the semaphore.
#[derive(Clone)]
pub struct BrokerHandle {
    broker: DynBroker,
    permits: Arc<Semaphore>,
    config: BrokerConfig,
}

impl BrokerHandle {
    pub fn new(broker: DynBroker, config: BrokerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_calls.max(1)));
        Self {
            broker,
            permits,
            config,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Permits currently free. Test and diagnostics use.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop handing out permits. Calls waiting for one fail with `Closed`.
    pub fn close(&self) {
        self.permits.close();
    }

    async fn permit(&self) -> ExecutorResult<SemaphorePermit<'_>> {
        self.permits.acquire().await.map_err(|_| ExecutorError::Closed)
    }

    /// Place an order, retrying rate-limited placements immediately.
    ///
    /// Rejections are returned as a `PlacedOrder` so callers can attach the
    /// broker message to their own error.
    ///
    /// # Errors
    ///
    /// `RateLimitExhausted` once `max_rate_limit_retries` consecutive
    /// placements were throttled; broker transport errors as-is.
    pub async fn place_order(
        &self,
        ticker: &Ticker,
        quantity: u64,
        side: OrderSide,
        price: Option<Price>,
    ) -> ExecutorResult<PlacedOrder> {
        if quantity == 0 {
            return Err(ExecutorError::InvalidOrder(format!(
                "{ticker}: zero quantity"
            )));
        }

        let mut retries = 0u32;
        loop {
            let placed = {
                let _permit = self.permit().await?;
                self.broker.place_order(ticker, quantity, side, price).await?
            };
            Metrics::order_attempt(&side.to_string(), &placed.status.to_string());

            match placed.status {
                PlaceStatus::RateLimited => {
                    retries += 1;
                    if retries > self.config.max_rate_limit_retries {
                        warn!(
                            %ticker,
                            %side,
                            retries,
                            message = %placed.message,
                            "Rate limit retries exhausted"
                        );
                        return Err(ExecutorError::RateLimitExhausted {
                            ticker: ticker.to_string(),
                            retries: self.config.max_rate_limit_retries,
                        });
                    }
                    debug!(%ticker, %side, retries, "Placement rate limited, retrying");
                }
                PlaceStatus::Accepted if placed.order_id.is_none() => {
                    return Err(ExecutorError::Broker(format!(
                        "{ticker}: accepted placement without order id"
                    )));
                }
                PlaceStatus::Accepted | PlaceStatus::Rejected => return Ok(placed),
            }
        }
    }

    pub async fn cancel_order(&self, order_id: &OrderId) -> ExecutorResult<()> {
        let _permit = self.permit().await?;
        self.broker.cancel_order(order_id).await
    }

    pub async fn query_fill(&self, order_id: &OrderId) -> ExecutorResult<FillStatus> {
        let _permit = self.permit().await?;
        self.broker.query_fill(order_id).await
    }

    pub async fn get_holdings(&self) -> ExecutorResult<Vec<Holding>> {
        let _permit = self.permit().await?;
        self.broker.get_holdings().await
    }

    /// Holding for one ticker, `None` when not held.
    pub async fn holding(&self, ticker: &Ticker) -> ExecutorResult<Option<Holding>> {
        let holdings = self.get_holdings().await?;
        Ok(holdings
            .into_iter()
            .find(|h| &h.ticker == ticker && h.quantity > 0))
    }

    pub async fn get_available_cash(&self) -> ExecutorResult<Decimal> {
        let _permit = self.permit().await?;
        self.broker.get_available_cash().await
    }

    pub async fn open_orders(&self, ticker: &Ticker) -> ExecutorResult<Vec<OpenOrder>> {
        let _permit = self.permit().await?;
        self.broker.open_orders(ticker).await
    }
}
