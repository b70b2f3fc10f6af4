//! Scriptable in-memory broker for tests.
//!
//! Placements are accepted by default with ids `M1, M2, ...` and fill in
//! full on the first query. Tests push scripted outcomes to exercise
//! throttling, rejections and partial fills:
//!
//! - `rate_limit_next(n)` / `reject_next(msg)` queue placement outcomes
//! - `script_fills(&[...])` sets the cumulative fill sequence of the next
//!   accepted order; each query pops one value, the last one sticks
//! - `fail_cancel_next(n)` / `fail_fill_query(nth)` make broker calls fail
//!   mid-reconciliation
//! - Fills move the simulated holdings, so a post-exit balance check sees
//!   what the fills left behind

use crate::broker::Broker;
use crate::error::{ExecutorError, ExecutorResult};
use krx_core::{
    BoxFuture, FillStatus, Holding, OpenOrder, OrderId, OrderSide, PlacedOrder, Price, Ticker,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A recorded placement request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub ticker: Ticker,
    pub quantity: u64,
    pub side: OrderSide,
    pub price: Option<Price>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Accepted,
    RateLimited,
    Rejected(String),
}

#[derive(Debug)]
struct MockOrder {
    ticker: Ticker,
    side: OrderSide,
    price: Option<Price>,
    quantity: u64,
    script: VecDeque<u64>,
    /// Fill already applied to holdings.
    settled: u64,
}

#[derive(Debug, Default)]
struct State {
    placements: Vec<Placement>,
    outcomes: VecDeque<Outcome>,
    fill_scripts: VecDeque<Vec<u64>>,
    orders: HashMap<OrderId, MockOrder>,
    cancels: Vec<OrderId>,
    holdings: Vec<Holding>,
    holding_snapshots: VecDeque<Vec<Holding>>,
    holdings_failures: usize,
    cancel_failures: usize,
    fill_queries: usize,
    failing_fill_queries: Vec<usize>,
    open_orders: Vec<OpenOrder>,
    cash: Decimal,
    next_id: u64,
}

/// Scriptable broker.
#[derive(Debug, Default)]
pub struct MockBroker {
    state: Mutex<State>,
    holdings_calls: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next placement is accepted. Queue before `reject_next` to refuse a
    /// later placement.
    pub fn accept_next(&self) {
        self.state.lock().outcomes.push_back(Outcome::Accepted);
    }

    /// Next `n` placements are throttled.
    pub fn rate_limit_next(&self, n: usize) {
        let mut state = self.state.lock();
        for _ in 0..n {
            state.outcomes.push_back(Outcome::RateLimited);
        }
    }

    /// Next placement is refused with `message`.
    pub fn reject_next(&self, message: impl Into<String>) {
        self.state
            .lock()
            .outcomes
            .push_back(Outcome::Rejected(message.into()));
    }

    /// Cumulative fill sequence for the next accepted order.
    pub fn script_fills(&self, cumulative: &[u64]) {
        self.state.lock().fill_scripts.push_back(cumulative.to_vec());
    }

    pub fn set_holding(&self, ticker: &str, quantity: u64, avg_price: Price) {
        let mut state = self.state.lock();
        state.holdings.retain(|h| h.ticker.as_str() != ticker);
        if quantity > 0 {
            state.holdings.push(Holding {
                ticker: Ticker::from(ticker),
                quantity,
                avg_price,
            });
        }
    }

    /// Snapshots returned by the next `get_holdings` calls, before falling
    /// back to the live holdings.
    pub fn queue_holdings(&self, snapshot: Vec<Holding>) {
        self.state.lock().holding_snapshots.push_back(snapshot);
    }

    /// Next `n` `get_holdings` calls fail.
    pub fn fail_holdings_next(&self, n: usize) {
        self.state.lock().holdings_failures += n;
    }

    /// Next `n` `cancel_order` calls fail.
    pub fn fail_cancel_next(&self, n: usize) {
        self.state.lock().cancel_failures += n;
    }

    /// The `nth` `query_fill` call (1-based, counted over the mock's
    /// lifetime) fails.
    pub fn fail_fill_query(&self, nth: usize) {
        self.state.lock().failing_fill_queries.push(nth);
    }

    pub fn set_cash(&self, cash: Decimal) {
        self.state.lock().cash = cash;
    }

    pub fn add_open_order(&self, order: OpenOrder) {
        self.state.lock().open_orders.push(order);
    }

    pub fn placements(&self) -> Vec<Placement> {
        self.state.lock().placements.clone()
    }

    pub fn cancels(&self) -> Vec<OrderId> {
        self.state.lock().cancels.clone()
    }

    pub fn holdings_calls(&self) -> usize {
        self.holdings_calls.load(Ordering::SeqCst)
    }

    pub fn held(&self, ticker: &str) -> u64 {
        self.state
            .lock()
            .holdings
            .iter()
            .find(|h| h.ticker.as_str() == ticker)
            .map_or(0, |h| h.quantity)
    }

    fn settle(state: &mut State, order_id: &OrderId, filled: u64) {
        let Some(order) = state.orders.get_mut(order_id) else {
            return;
        };
        let delta = filled.saturating_sub(order.settled);
        if delta == 0 {
            return;
        }
        order.settled = filled;
        let (ticker, side, price) = (order.ticker.clone(), order.side, order.price);

        let price = price.unwrap_or(Price::ZERO);
        match side {
            OrderSide::Buy => {
                state.cash -= price.notional(delta);
                match state.holdings.iter_mut().find(|h| h.ticker == ticker) {
                    Some(h) => {
                        let cost = h.avg_price.notional(h.quantity) + price.notional(delta);
                        h.quantity += delta;
                        h.avg_price = Price::new(cost / Decimal::from(h.quantity));
                    }
                    None => state.holdings.push(Holding {
                        ticker,
                        quantity: delta,
                        avg_price: price,
                    }),
                }
            }
            OrderSide::Sell => {
                state.cash += price.notional(delta);
                if let Some(h) = state.holdings.iter_mut().find(|h| h.ticker == ticker) {
                    h.quantity = h.quantity.saturating_sub(delta);
                }
                state.holdings.retain(|h| h.quantity > 0);
            }
        }
    }
}

impl Broker for MockBroker {
    fn place_order<'a>(
        &'a self,
        ticker: &'a Ticker,
        quantity: u64,
        side: OrderSide,
        price: Option<Price>,
    ) -> BoxFuture<'a, ExecutorResult<PlacedOrder>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.placements.push(Placement {
                ticker: ticker.clone(),
                quantity,
                side,
                price,
            });
            match state.outcomes.pop_front() {
                Some(Outcome::RateLimited) => {
                    return Ok(PlacedOrder::rate_limited("초당 거래건수를 초과하였습니다."))
                }
                Some(Outcome::Rejected(message)) => return Ok(PlacedOrder::rejected(message)),
                Some(Outcome::Accepted) | None => {}
            }

            state.next_id += 1;
            let order_id = OrderId::new(format!("M{}", state.next_id));
            let script = state
                .fill_scripts
                .pop_front()
                .unwrap_or_else(|| vec![quantity]);
            state.orders.insert(
                order_id.clone(),
                MockOrder {
                    ticker: ticker.clone(),
                    side,
                    price,
                    quantity,
                    script: script.into(),
                    settled: 0,
                },
            );
            Ok(PlacedOrder::accepted(order_id))
        })
    }

    fn cancel_order<'a>(&'a self, order_id: &'a OrderId) -> BoxFuture<'a, ExecutorResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.cancel_failures > 0 {
                state.cancel_failures -= 1;
                return Err(ExecutorError::Broker("connection reset".to_string()));
            }
            state.cancels.push(order_id.clone());
            state.open_orders.retain(|o| &o.order_id != order_id);
            Ok(())
        })
    }

    fn query_fill<'a>(
        &'a self,
        order_id: &'a OrderId,
    ) -> BoxFuture<'a, ExecutorResult<FillStatus>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.fill_queries += 1;
            let call = state.fill_queries;
            if state.failing_fill_queries.contains(&call) {
                return Err(ExecutorError::Broker("fill inquiry timed out".to_string()));
            }
            let order = state
                .orders
                .get_mut(order_id)
                .ok_or_else(|| ExecutorError::Broker(format!("unknown order {order_id}")))?;
            let next = if order.script.len() > 1 {
                order.script.pop_front()
            } else {
                order.script.front().copied()
            };
            let filled = next.unwrap_or(0).min(order.quantity);
            let remaining = order.quantity - filled;
            Self::settle(&mut state, order_id, filled);
            Ok(FillStatus { filled, remaining })
        })
    }

    fn get_holdings(&self) -> BoxFuture<'_, ExecutorResult<Vec<Holding>>> {
        Box::pin(async move {
            self.holdings_calls.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock();
            if state.holdings_failures > 0 {
                state.holdings_failures -= 1;
                return Err(ExecutorError::Broker("balance inquiry failed".to_string()));
            }
            if let Some(snapshot) = state.holding_snapshots.pop_front() {
                return Ok(snapshot);
            }
            Ok(state.holdings.clone())
        })
    }

    fn get_available_cash(&self) -> BoxFuture<'_, ExecutorResult<Decimal>> {
        Box::pin(async move { Ok(self.state.lock().cash) })
    }

    fn open_orders<'a>(
        &'a self,
        ticker: &'a Ticker,
    ) -> BoxFuture<'a, ExecutorResult<Vec<OpenOrder>>> {
        Box::pin(async move {
            Ok(self
                .state
                .lock()
                .open_orders
                .iter()
                .filter(|o| &o.ticker == ticker)
                .cloned()
                .collect())
        })
    }
}
