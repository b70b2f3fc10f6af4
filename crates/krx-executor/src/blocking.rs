//! Adapter for blocking broker clients.
//!
//! Broker SDKs are usually synchronous HTTP clients. `BlockingBroker` runs
//! each call on tokio's blocking pool, never on a runtime worker, and bounds
//! how many blocking calls may be in flight at once.

use crate::broker::Broker;
use crate::error::{ExecutorError, ExecutorResult};
use krx_core::{
    BoxFuture, FillStatus, Holding, OpenOrder, OrderId, OrderSide, PlacedOrder, Price, Ticker,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Synchronous broker interface.
pub trait SyncBroker: Send + Sync + 'static {
    fn place_order(
        &self,
        ticker: &Ticker,
        quantity: u64,
        side: OrderSide,
        price: Option<Price>,
    ) -> ExecutorResult<PlacedOrder>;

    fn cancel_order(&self, order_id: &OrderId) -> ExecutorResult<()>;

    fn query_fill(&self, order_id: &OrderId) -> ExecutorResult<FillStatus>;

    fn get_holdings(&self) -> ExecutorResult<Vec<Holding>>;

    fn get_available_cash(&self) -> ExecutorResult<Decimal>;

    fn open_orders(&self, ticker: &Ticker) -> ExecutorResult<Vec<OpenOrder>>;
}

/// Runs a [`SyncBroker`] on a bounded blocking worker pool.
pub struct BlockingBroker<B: SyncBroker> {
    inner: Arc<B>,
    workers: Arc<Semaphore>,
}

impl<B: SyncBroker> BlockingBroker<B> {
    pub fn new(inner: B, max_workers: usize) -> Self {
        Self {
            inner: Arc::new(inner),
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn run<T, F>(&self, call: F) -> ExecutorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&B) -> ExecutorResult<T> + Send + 'static,
    {
        let _worker = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutorError::Closed)?;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || call(&inner))
            .await
            .map_err(|e| ExecutorError::Worker(e.to_string()))?
    }
}

impl<B: SyncBroker> Broker for BlockingBroker<B> {
    fn place_order<'a>(
        &'a self,
        ticker: &'a Ticker,
        quantity: u64,
        side: OrderSide,
        price: Option<Price>,
    ) -> BoxFuture<'a, ExecutorResult<PlacedOrder>> {
        let ticker = ticker.clone();
        Box::pin(self.run(move |b| b.place_order(&ticker, quantity, side, price)))
    }

    fn cancel_order<'a>(&'a self, order_id: &'a OrderId) -> BoxFuture<'a, ExecutorResult<()>> {
        let order_id = order_id.clone();
        Box::pin(self.run(move |b| b.cancel_order(&order_id)))
    }

    fn query_fill<'a>(
        &'a self,
        order_id: &'a OrderId,
    ) -> BoxFuture<'a, ExecutorResult<FillStatus>> {
        let order_id = order_id.clone();
        Box::pin(self.run(move |b| b.query_fill(&order_id)))
    }

    fn get_holdings(&self) -> BoxFuture<'_, ExecutorResult<Vec<Holding>>> {
        Box::pin(self.run(|b| b.get_holdings()))
    }

    fn get_available_cash(&self) -> BoxFuture<'_, ExecutorResult<Decimal>> {
        Box::pin(self.run(|b| b.get_available_cash()))
    }

    fn open_orders<'a>(
        &'a self,
        ticker: &'a Ticker,
    ) -> BoxFuture<'a, ExecutorResult<Vec<OpenOrder>>> {
        let ticker = ticker.clone();
        Box::pin(self.run(move |b| b.open_orders(&ticker)))
    }
}
