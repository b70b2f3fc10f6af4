//! Exit execution.
//!
//! `OrderExecutor` is the capability a position monitor is handed for
//! closing its position. `BrokerExitExecutor` is the production
//! implementation: a limit sell at the safe price, driven to completion by
//! the fill reconciler, with the session updated from what actually filled.

use crate::broker::BrokerHandle;
use crate::error::{ExecutorError, ExecutorResult};
use crate::fill::{FillReconciler, ReconcileRequest};
use krx_core::{
    filled_total, BoxFuture, ExitReason, OrderAttempt, OrderSide, Price, Session, SessionId,
    Ticker,
};
use krx_persistence::{DynSessionStore, TradeJournal, TradeRecord};
use std::sync::Arc;
use tracing::{error, info, warn};

/// A request to close (part of) a position.
#[derive(Debug, Clone)]
pub struct ExitRequest {
    pub session_id: SessionId,
    pub ticker: Ticker,
    /// Shares to sell, already clamped to the verified holding.
    pub quantity: u64,
    /// Limit price.
    pub price: Price,
    pub reason: ExitReason,
}

impl ExitRequest {
    /// Request for a session record the caller already holds.
    pub fn for_session(session: &Session, quantity: u64, price: Price, reason: ExitReason) -> Self {
        Self {
            session_id: session.id,
            ticker: session.ticker.clone(),
            quantity,
            price,
            reason,
        }
    }
}

/// What an exit achieved.
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub attempts: Vec<OrderAttempt>,
    pub sold: u64,
    /// Session quantity after the sell, `None` when the session is gone.
    pub session_remaining: Option<u64>,
}

/// Exit capability injected into position monitors.
pub trait OrderExecutor: Send + Sync {
    fn execute_exit<'a>(&'a self, request: &'a ExitRequest)
        -> BoxFuture<'a, ExecutorResult<ExitReport>>;
}

/// Arc wrapper for OrderExecutor trait objects.
pub type DynOrderExecutor = Arc<dyn OrderExecutor>;

/// Sells through the shared broker handle.
pub struct BrokerExitExecutor {
    broker: BrokerHandle,
    reconciler: FillReconciler,
    store: DynSessionStore,
    journal: Option<Arc<TradeJournal>>,
}

impl BrokerExitExecutor {
    pub fn new(reconciler: FillReconciler, store: DynSessionStore) -> Self {
        Self {
            broker: reconciler.broker().clone(),
            reconciler,
            store,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<TradeJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    async fn sell(&self, request: &ExitRequest) -> ExecutorResult<Vec<OrderAttempt>> {
        let placed = self
            .broker
            .place_order(
                &request.ticker,
                request.quantity,
                OrderSide::Sell,
                Some(request.price),
            )
            .await?;
        let reconcile = ReconcileRequest {
            ticker: request.ticker.clone(),
            side: OrderSide::Sell,
            price: Some(request.price),
            requested: request.quantity,
        };
        self.reconciler.reconcile(&reconcile, placed).await
    }

    /// Apply `sold` shares to the stored session. Deletes it once flat.
    async fn settle_session(
        &self,
        request: &ExitRequest,
        sold: u64,
    ) -> ExecutorResult<Option<u64>> {
        let Some(mut session) = self.store.get(request.session_id).await? else {
            warn!(
                ticker = %request.ticker,
                session_id = %request.session_id,
                "Session vanished during exit"
            );
            return Ok(None);
        };
        let remaining = session.apply_sell(sold);
        if remaining == 0 {
            self.store.delete(session.id).await?;
            info!(ticker = %session.ticker, session_id = %session.id, "Session closed");
            Ok(None)
        } else {
            self.store.update(session).await?;
            Ok(Some(remaining))
        }
    }

    fn journal(
        &self,
        request: &ExitRequest,
        attempts: &[OrderAttempt],
        err: Option<&ExecutorError>,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let mut record = TradeRecord::new(
            request.session_id,
            request.ticker.clone(),
            OrderSide::Sell,
            request.reason.as_str(),
            request.quantity,
            attempts.to_vec(),
        );
        if let Some(e) = err {
            record = record.with_error(e.to_string());
        }
        if let Err(e) = journal.append(&record) {
            warn!(ticker = %request.ticker, ?e, "Failed to journal exit");
        }
    }
}

impl OrderExecutor for BrokerExitExecutor {
    fn execute_exit<'a>(
        &'a self,
        request: &'a ExitRequest,
    ) -> BoxFuture<'a, ExecutorResult<ExitReport>> {
        Box::pin(async move {
            info!(
                ticker = %request.ticker,
                quantity = request.quantity,
                price = %request.price,
                reason = %request.reason,
                "Executing exit"
            );

            let result = self.sell(request).await;
            let attempts = match &result {
                Ok(attempts) => attempts.clone(),
                Err(e) => e.attempts().to_vec(),
            };
            let sold = filled_total(&attempts);

            // Record partial fills even when the execution failed.
            let session_remaining = if sold > 0 {
                match self.settle_session(request, sold).await {
                    Ok(remaining) => remaining,
                    Err(e) => {
                        error!(
                            ticker = %request.ticker,
                            sold,
                            ?e,
                            "Failed to update session after exit"
                        );
                        self.journal(request, &attempts, Some(&e));
                        return Err(e);
                    }
                }
            } else {
                self.store.get(request.session_id).await?.map(|s| s.quantity)
            };

            self.journal(request, &attempts, result.as_ref().err());
            result?;

            info!(ticker = %request.ticker, sold, ?session_remaining, "Exit complete");
            Ok(ExitReport {
                attempts,
                sold,
                session_remaining,
            })
        })
    }
}
