//! Paper trading broker with simulated fills.
//!
//! Simulates the brokerage without real money:
//! - Orders fill in full at their limit price as soon as they are placed
//! - Market orders fill at the last price set with `set_market_price`
//! - Cash and holdings are tracked; buys beyond cash and sells beyond the
//!   holding are rejected the way the broker would
//!
//! Does not simulate partial fills, queue position or market impact.

use crate::broker::Broker;
use crate::error::{ExecutorError, ExecutorResult};
use dashmap::DashMap;
use krx_core::{
    BoxFuture, FillStatus, Holding, OpenOrder, OrderId, OrderSide, PlacedOrder, Price, Ticker,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

/// Configuration for the paper broker.
#[derive(Debug, Clone, Deserialize)]
pub struct PaperBrokerConfig {
    /// Starting cash in won.
    #[serde(default = "default_initial_cash")]
    pub initial_cash: Decimal,
}

fn default_initial_cash() -> Decimal {
    Decimal::from(10_000_000)
}

impl Default for PaperBrokerConfig {
    fn default() -> Self {
        Self {
            initial_cash: default_initial_cash(),
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    quantity: u64,
    filled: u64,
}

/// Paper broker.
pub struct PaperBroker {
    cash: Mutex<Decimal>,
    holdings: DashMap<Ticker, Holding>,
    orders: DashMap<OrderId, PaperOrder>,
    market_prices: DashMap<Ticker, Price>,
}

impl PaperBroker {
    pub fn new(config: PaperBrokerConfig) -> Self {
        info!(initial_cash = %config.initial_cash, "Paper broker started");
        Self {
            cash: Mutex::new(config.initial_cash),
            holdings: DashMap::new(),
            orders: DashMap::new(),
            market_prices: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PaperBrokerConfig::default())
    }

    /// Reference price for market orders.
    pub fn set_market_price(&self, ticker: Ticker, price: Price) {
        self.market_prices.insert(ticker, price);
    }

    /// Seed a holding, e.g. to mirror sessions loaded at startup.
    pub fn seed_holding(&self, holding: Holding) {
        self.holdings.insert(holding.ticker.clone(), holding);
    }

    pub fn cash(&self) -> Decimal {
        *self.cash.lock()
    }

    fn fill_price(&self, ticker: &Ticker, price: Option<Price>) -> Option<Price> {
        price.or_else(|| self.market_prices.get(ticker).map(|p| *p))
    }

    fn simulate(
        &self,
        ticker: &Ticker,
        quantity: u64,
        side: OrderSide,
        price: Option<Price>,
    ) -> PlacedOrder {
        let Some(fill_price) = self.fill_price(ticker, price).filter(|p| p.is_positive()) else {
            return PlacedOrder::rejected(format!("no reference price for {ticker}"));
        };
        let notional = fill_price.notional(quantity);

        match side {
            OrderSide::Buy => {
                let mut cash = self.cash.lock();
                if notional > *cash {
                    return PlacedOrder::rejected(format!(
                        "insufficient cash: available={}, required={notional}",
                        *cash
                    ));
                }
                *cash -= notional;
                drop(cash);

                let mut entry = self.holdings.entry(ticker.clone()).or_insert(Holding {
                    ticker: ticker.clone(),
                    quantity: 0,
                    avg_price: Price::ZERO,
                });
                let cost = entry.avg_price.notional(entry.quantity) + notional;
                entry.quantity += quantity;
                entry.avg_price = Price::new(cost / Decimal::from(entry.quantity));
            }
            OrderSide::Sell => {
                {
                    let Some(mut held) = self.holdings.get_mut(ticker) else {
                        return PlacedOrder::rejected(format!("no holding in {ticker}"));
                    };
                    if held.quantity < quantity {
                        return PlacedOrder::rejected(format!(
                            "sell {quantity} exceeds holding {}",
                            held.quantity
                        ));
                    }
                    held.quantity -= quantity;
                }
                self.holdings.remove_if(ticker, |_, h| h.quantity == 0);
                *self.cash.lock() += notional;
            }
        }

        let order_id = OrderId::new(format!("paper-{}", Uuid::new_v4()));
        self.orders.insert(
            order_id.clone(),
            PaperOrder {
                quantity,
                filled: quantity,
            },
        );
        debug!(%ticker, %side, quantity, price = %fill_price, %order_id, "Paper fill");
        PlacedOrder::accepted(order_id)
    }
}

impl Broker for PaperBroker {
    fn place_order<'a>(
        &'a self,
        ticker: &'a Ticker,
        quantity: u64,
        side: OrderSide,
        price: Option<Price>,
    ) -> BoxFuture<'a, ExecutorResult<PlacedOrder>> {
        Box::pin(async move { Ok(self.simulate(ticker, quantity, side, price)) })
    }

    fn cancel_order<'a>(&'a self, order_id: &'a OrderId) -> BoxFuture<'a, ExecutorResult<()>> {
        Box::pin(async move {
            // Everything fills on placement; cancelling only forgets the
            // unfilled rest, of which there is none.
            match self.orders.get_mut(order_id) {
                Some(mut order) => {
                    order.quantity = order.filled;
                    Ok(())
                }
                None => Err(ExecutorError::Broker(format!("unknown order {order_id}"))),
            }
        })
    }

    fn query_fill<'a>(
        &'a self,
        order_id: &'a OrderId,
    ) -> BoxFuture<'a, ExecutorResult<FillStatus>> {
        Box::pin(async move {
            let order = self
                .orders
                .get(order_id)
                .ok_or_else(|| ExecutorError::Broker(format!("unknown order {order_id}")))?;
            Ok(FillStatus {
                filled: order.filled,
                remaining: order.quantity - order.filled,
            })
        })
    }

    fn get_holdings(&self) -> BoxFuture<'_, ExecutorResult<Vec<Holding>>> {
        Box::pin(async move {
            let mut holdings: Vec<Holding> =
                self.holdings.iter().map(|h| h.value().clone()).collect();
            holdings.sort_by(|a, b| a.ticker.cmp(&b.ticker));
            Ok(holdings)
        })
    }

    fn get_available_cash(&self) -> BoxFuture<'_, ExecutorResult<Decimal>> {
        Box::pin(async move { Ok(self.cash()) })
    }

    fn open_orders<'a>(
        &'a self,
        _ticker: &'a Ticker,
    ) -> BoxFuture<'a, ExecutorResult<Vec<OpenOrder>>> {
        Box::pin(async move { Ok(Vec::new()) })
    }
}
