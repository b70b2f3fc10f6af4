//! Order fill reconciliation.
//!
//! Drives a placed order to completion:
//!
//! ```text
//! settle wait -> query fill -> record attempt -> remaining == 0? done
//!      ^                                               |
//!      |                                               v
//!      +-- resubmit remaining <- pacing delay <- cancel (+ late-fill check)
//! ```
//!
//! Loop invariant: the attempts' `filled` sum plus the current order's
//! outstanding quantity equals the requested quantity. A fill that lands
//! between the last query and the cancel is picked up by a second query
//! after the cancel, so it is never resubmitted.

use crate::broker::BrokerHandle;
use crate::error::{ExecutorError, ExecutorResult};
use krx_core::{
    filled_total, OrderAttempt, OrderId, OrderSide, PlaceStatus, PlacedOrder, Price, Ticker,
};
use krx_telemetry::Metrics;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Reconciler timing and ceiling.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    /// Wait after every placement before querying fills.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Wait between cancel and resubmit (broker per-second quota).
    #[serde(default = "default_pacing_delay_ms")]
    pub pacing_delay_ms: u64,
    /// Query rounds before giving up.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

fn default_settle_delay_ms() -> u64 {
    1_000
}

fn default_pacing_delay_ms() -> u64 {
    200
}

fn default_max_rounds() -> usize {
    20
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            pacing_delay_ms: default_pacing_delay_ms(),
            max_rounds: default_max_rounds(),
        }
    }
}

/// One order to reconcile.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub ticker: Ticker,
    pub side: OrderSide,
    /// Limit price; `None` for market orders.
    pub price: Option<Price>,
    pub requested: u64,
}

impl ReconcileRequest {
    fn attempt(&self, order_id: OrderId, requested: u64) -> OrderAttempt {
        OrderAttempt {
            ticker: self.ticker.clone(),
            order_id,
            side: self.side,
            price: self.price.unwrap_or(Price::ZERO),
            requested,
            filled: 0,
            remaining: requested,
            status: PlaceStatus::Accepted,
            message: String::new(),
        }
    }

    fn rejected(&self, placed: &PlacedOrder, requested: u64) -> OrderAttempt {
        OrderAttempt {
            status: placed.status,
            message: placed.message.clone(),
            ..self.attempt(OrderId::new(""), requested)
        }
    }
}

/// Cancel/resubmit loop over the shared broker handle.
#[derive(Clone)]
pub struct FillReconciler {
    broker: BrokerHandle,
    config: ReconcileConfig,
}

impl FillReconciler {
    pub fn new(broker: BrokerHandle, config: ReconcileConfig) -> Self {
        Self { broker, config }
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    /// Reconcile `initial` until `request.requested` shares have filled.
    ///
    /// Returns the ordered attempt list; its `filled` sum equals
    /// `request.requested`.
    ///
    /// # Errors
    ///
    /// Every error raised after the first fill query carries the attempts
    /// recorded so far, so callers can always account for filled shares.
    ///
    /// - `OrderRejected`: `initial` or a resubmission was refused.
    /// - `ReconcileExhausted`: `max_rounds` queries without completing. The
    ///   working order is cancelled first.
    /// - `Interrupted`: a query, cancel or resubmission call failed (broker
    ///   error, `RateLimitExhausted`) after at least one attempt was recorded.
    /// - Broker errors from the first fill query, before anything is known.
    pub async fn reconcile(
        &self,
        request: &ReconcileRequest,
        initial: PlacedOrder,
    ) -> ExecutorResult<Vec<OrderAttempt>> {
        let ticker = &request.ticker;
        let mut attempts: Vec<OrderAttempt> = Vec::new();

        let Some(order_id) = initial.accepted_id().cloned() else {
            attempts.push(request.rejected(&initial, request.requested));
            return Err(ExecutorError::OrderRejected {
                ticker: ticker.to_string(),
                message: initial.message,
                attempts,
            });
        };

        match self.drive(request, order_id, &mut attempts).await {
            Ok(()) => Ok(attempts),
            Err(e) if attempts.is_empty() => Err(e),
            Err(e) => {
                warn!(
                    %ticker,
                    filled = filled_total(&attempts),
                    error = %e,
                    "Fill reconciliation interrupted"
                );
                Err(ExecutorError::Interrupted {
                    ticker: ticker.to_string(),
                    source: Box::new(e),
                    attempts,
                })
            }
        }
    }

    /// The reconcile loop. Terminal errors that carry attempts take them
    /// out of `attempts`; any other error leaves them in place.
    async fn drive(
        &self,
        request: &ReconcileRequest,
        mut order_id: OrderId,
        attempts: &mut Vec<OrderAttempt>,
    ) -> ExecutorResult<()> {
        let ticker = &request.ticker;
        let mut outstanding = request.requested;
        let mut round = 0usize;

        loop {
            round += 1;
            tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;

            let status = self.broker.query_fill(&order_id).await?;
            let filled = status.filled.min(outstanding);
            if filled + status.remaining != outstanding {
                warn!(
                    %ticker,
                    %order_id,
                    outstanding,
                    filled = status.filled,
                    remaining = status.remaining,
                    "Fill report does not add up, trusting filled quantity"
                );
            }
            let mut attempt = request.attempt(order_id.clone(), outstanding);
            attempt.filled = filled;
            attempt.remaining = outstanding - filled;
            outstanding = attempt.remaining;
            attempts.push(attempt);

            debug!(%ticker, %order_id, round, filled, outstanding, "Fill queried");

            if outstanding == 0 {
                Metrics::reconcile_rounds(round);
                info!(
                    %ticker,
                    side = %request.side,
                    requested = request.requested,
                    rounds = round,
                    "Order fully filled"
                );
                return Ok(());
            }

            self.broker.cancel_order(&order_id).await?;
            outstanding = self.absorb_late_fill(&order_id, attempts).await?;
            if outstanding == 0 {
                Metrics::reconcile_rounds(round);
                info!(%ticker, rounds = round, "Order filled during cancel");
                return Ok(());
            }

            if round >= self.config.max_rounds {
                Metrics::reconcile_rounds(round);
                warn!(
                    %ticker,
                    rounds = round,
                    filled = filled_total(attempts),
                    outstanding,
                    "Fill reconciliation exhausted"
                );
                return Err(ExecutorError::ReconcileExhausted {
                    ticker: ticker.to_string(),
                    rounds: round,
                    attempts: std::mem::take(attempts),
                });
            }

            tokio::time::sleep(Duration::from_millis(self.config.pacing_delay_ms)).await;

            let placed = self
                .broker
                .place_order(ticker, outstanding, request.side, request.price)
                .await?;
            match placed.accepted_id() {
                Some(id) => {
                    debug!(
                        %ticker,
                        old = %order_id,
                        new = %id,
                        outstanding,
                        "Resubmitted remainder"
                    );
                    order_id = id.clone();
                }
                None => {
                    warn!(%ticker, outstanding, message = %placed.message, "Resubmission rejected");
                    attempts.push(request.rejected(&placed, outstanding));
                    return Err(ExecutorError::OrderRejected {
                        ticker: ticker.to_string(),
                        message: placed.message,
                        attempts: std::mem::take(attempts),
                    });
                }
            }
        }
    }

    /// Re-query a cancelled order and fold any fill that landed before the
    /// cancel into its attempt. Returns the new outstanding quantity.
    async fn absorb_late_fill(
        &self,
        order_id: &OrderId,
        attempts: &mut [OrderAttempt],
    ) -> ExecutorResult<u64> {
        let Some(last) = attempts.last_mut() else {
            return Ok(0);
        };
        let after = self.broker.query_fill(order_id).await?;
        let filled = after.filled.min(last.requested);
        if filled > last.filled {
            debug!(
                ticker = %last.ticker,
                %order_id,
                late = filled - last.filled,
                "Late fill before cancel"
            );
            last.filled = filled;
            last.remaining = last.requested - filled;
        }
        Ok(last.remaining)
    }
}
