//! Per-ticker position monitor.
//!
//! One task per managed session. It waits on the ticker's quote queue,
//! runs every frame through the exit rule and, when a rule fires, closes
//! the position under the ticker's lock.
//!
//! # States
//!
//! ```text
//! Idle → Subscribed ⇄ Evaluating → Exiting → Terminated
//!             ↑                        │
//!             └──── exit failed ───────┘
//! ```
//!
//! - The queue wait is bounded; a timeout is a recheck (registration and
//!   subscription gates), not an error.
//! - Cancellation is observed only while waiting on the queue. An exit that
//!   has started always runs to completion.
//! - Teardown releases the queue (own generation only) and the lock entry
//!   (only if unlocked), then reports the outcome.

use crate::clock::DynClock;
use crate::error::{PositionError, PositionResult};
use crate::exit_rule::{ExitRule, ExitRuleConfig, Verdict};
use crate::lock_registry::LockRegistry;
use krx_core::{ExitReason, OrderSide, Price, Session, SessionId, Ticker};
use krx_executor::{BrokerHandle, DynOrderExecutor, ExecutorError, ExitRequest};
use krx_persistence::DynSessionStore;
use krx_telemetry::{Alert, AlertKind, Metrics, Notifier};
use krx_ws::{DynQuoteSubscriptions, SubscriptionHandle};
use parking_lot::RwLock;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Monitor tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Queue wait before a recheck tick.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
    /// Balance inquiries before an exit cycle is skipped.
    #[serde(default = "default_holding_check_attempts")]
    pub holding_check_attempts: u32,
    #[serde(default = "default_holding_check_backoff_ms")]
    pub holding_check_backoff_ms: u64,
    #[serde(default)]
    pub exit_rule: ExitRuleConfig,
}

fn default_queue_timeout_ms() -> u64 {
    5_000
}

fn default_holding_check_attempts() -> u32 {
    3
}

fn default_holding_check_backoff_ms() -> u64 {
    500
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_timeout_ms: default_queue_timeout_ms(),
            holding_check_attempts: default_holding_check_attempts(),
            holding_check_backoff_ms: default_holding_check_backoff_ms(),
            exit_rule: ExitRuleConfig::default(),
        }
    }
}

// ============================================================================
// State and outcome
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Subscribed,
    Evaluating,
    Exiting,
    Terminated,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Subscribed => "subscribed",
            Self::Evaluating => "evaluating",
            Self::Exiting => "exiting",
            Self::Terminated => "terminated",
        }
    }
}

/// Why a monitor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Position sold and the broker confirms nothing is left.
    Exited,
    /// Broker held nothing when an exit was about to start.
    AlreadyFlat,
    Cancelled,
    /// Queue closed or registration replaced by a newer monitor.
    QueueClosed,
    /// Exit reported success but shares remain at the broker.
    ResidualHolding { remaining: u64 },
}

impl MonitorOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exited => "exited",
            Self::AlreadyFlat => "already_flat",
            Self::Cancelled => "cancelled",
            Self::QueueClosed => "queue_closed",
            Self::ResidualHolding { .. } => "residual_holding",
        }
    }
}

impl fmt::Display for MonitorOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResidualHolding { remaining } => write!(f, "residual_holding({remaining})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Sent to the orchestrator when a monitor ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub ticker: Ticker,
    pub session_id: SessionId,
    pub generation: u64,
    pub outcome: MonitorOutcome,
}

// ============================================================================
// Dependencies and handle
// ============================================================================

/// Shared services a monitor is built from.
#[derive(Clone)]
pub struct MonitorDeps {
    pub subscriptions: DynQuoteSubscriptions,
    pub broker: BrokerHandle,
    pub executor: DynOrderExecutor,
    pub store: DynSessionStore,
    pub locks: Arc<LockRegistry>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: DynClock,
    pub reports: mpsc::Sender<MonitorReport>,
}

/// Orchestrator-side handle to a running monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    pub ticker: Ticker,
    pub session_id: SessionId,
    pub generation: u64,
    cancel: CancellationToken,
    state: Arc<RwLock<MonitorState>>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Ask the monitor to stop at its next queue wait.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> MonitorState {
        *self.state.read()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task. `Err` means it panicked or was aborted, in which
    /// case teardown did not run and falls to the caller.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        self.join.await
    }
}

/// Release a monitor's queue and lock entry.
///
/// Run by the monitor itself on every normal exit, and by the orchestrator
/// after a monitor task ended abnormally. Safe to repeat.
pub fn release_monitor_resources(
    subscriptions: &DynQuoteSubscriptions,
    locks: &LockRegistry,
    ticker: &Ticker,
    generation: u64,
) {
    if !subscriptions.release(ticker, generation) {
        debug!(%ticker, generation, "Queue already released or replaced");
    }
    locks.remove_if_unlocked(ticker);
}

/// Register, subscribe and spawn a monitor for `session`.
///
/// `cancel` is typically a child of the orchestrator's shutdown token.
pub async fn spawn_monitor(
    session: Session,
    config: MonitorConfig,
    deps: MonitorDeps,
    cancel: CancellationToken,
) -> PositionResult<MonitorHandle> {
    let ticker = session.ticker.clone();
    let handle = deps.subscriptions.register(ticker.clone());
    let generation = handle.generation;

    if let Err(e) = deps.subscriptions.subscribe(&ticker).await {
        deps.subscriptions.release(&ticker, generation);
        return Err(PositionError::Ws(e));
    }

    let state = Arc::new(RwLock::new(MonitorState::Idle));
    let monitor = PositionMonitor {
        rule: ExitRule::new(config.exit_rule.clone()),
        session_id: session.id,
        session,
        queue: handle,
        config,
        deps,
        cancel: cancel.clone(),
        state: state.clone(),
    };

    info!(
        %ticker,
        session_id = %monitor.session_id,
        generation,
        quantity = monitor.session.quantity,
        avg_price = %monitor.session.avg_price,
        target_date = %monitor.session.target_date,
        "Position monitor started"
    );
    Metrics::monitor_started();
    let session_id = monitor.session_id;
    let join = tokio::spawn(monitor.run());

    Ok(MonitorHandle {
        ticker,
        session_id,
        generation,
        cancel,
        state,
        join,
    })
}

// ============================================================================
// Monitor task
// ============================================================================

struct PositionMonitor {
    session_id: SessionId,
    /// Last known copy of the stored session.
    session: Session,
    queue: SubscriptionHandle,
    rule: ExitRule,
    config: MonitorConfig,
    deps: MonitorDeps,
    cancel: CancellationToken,
    state: Arc<RwLock<MonitorState>>,
}

impl PositionMonitor {
    fn ticker(&self) -> &Ticker {
        &self.queue.ticker
    }

    fn set_state(&self, state: MonitorState) {
        *self.state.write() = state;
    }

    async fn run(mut self) {
        let outcome = self.watch().await;
        self.set_state(MonitorState::Terminated);

        let ticker = self.ticker().clone();
        let generation = self.queue.generation;
        release_monitor_resources(&self.deps.subscriptions, &self.deps.locks, &ticker, generation);
        Metrics::monitor_stopped(outcome.as_str());
        info!(%ticker, generation, %outcome, "Position monitor stopped");

        let report = MonitorReport {
            ticker,
            session_id: self.session_id,
            generation,
            outcome,
        };
        if self.deps.reports.send(report).await.is_err() {
            debug!("Report receiver gone");
        }
    }

    async fn watch(&mut self) -> MonitorOutcome {
        let queue_timeout = Duration::from_millis(self.config.queue_timeout_ms);
        loop {
            self.set_state(MonitorState::Subscribed);
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return MonitorOutcome::Cancelled,
                r = tokio::time::timeout(queue_timeout, self.queue.rx.recv()) => r,
            };

            let raw = match received {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    info!(ticker = %self.ticker(), "Quote queue closed");
                    return MonitorOutcome::QueueClosed;
                }
                Err(_) => {
                    if let Some(outcome) = self.recheck().await {
                        return outcome;
                    }
                    continue;
                }
            };

            self.set_state(MonitorState::Evaluating);
            let now = self.deps.clock.now();
            let verdict = self.rule.evaluate(
                &raw,
                self.session.avg_price,
                self.session.target_date,
                now,
            );
            let Verdict::Exit { reason, safe_price } = verdict else {
                continue;
            };

            self.set_state(MonitorState::Exiting);
            Metrics::exit_triggered(reason.as_str());
            if let Some(outcome) = self.try_exit(reason, safe_price).await {
                return outcome;
            }
        }
    }

    /// Queue-timeout tick. Ends the monitor if its registration is gone and
    /// restores a lost subscription otherwise.
    async fn recheck(&mut self) -> Option<MonitorOutcome> {
        let ticker = self.ticker().clone();
        if !self
            .deps
            .subscriptions
            .is_current(&ticker, self.queue.generation)
        {
            info!(%ticker, generation = self.queue.generation, "Registration replaced");
            return Some(MonitorOutcome::QueueClosed);
        }
        if !self.deps.subscriptions.is_subscribed(&ticker) {
            warn!(%ticker, "Subscription missing, resubscribing");
            if let Err(e) = self.deps.subscriptions.subscribe(&ticker).await {
                warn!(%ticker, ?e, "Resubscribe on recheck failed");
            }
        }
        let now = self.deps.clock.now();
        if !self.config.exit_rule.window.contains(now) {
            trace!(%ticker, %now, "Idle outside trading hours");
        }
        None
    }

    /// One exit cycle. `None` means keep monitoring.
    async fn try_exit(&mut self, reason: ExitReason, safe_price: Price) -> Option<MonitorOutcome> {
        let ticker = self.ticker().clone();
        let locks = self.deps.locks.clone();
        let _guard = match locks.acquire(&ticker).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(%ticker, %reason, error = %e, "Exit lock busy, skipping cycle");
                Metrics::lock_timeout(ticker.as_str());
                return None;
            }
        };

        let held = match self.verify_holding().await {
            Ok(held) => held,
            Err(e) => {
                warn!(%ticker, error = %e, "Holding check failed, skipping cycle");
                return None;
            }
        };

        if held == 0 {
            warn!(
                %ticker,
                session_quantity = self.session.quantity,
                "Broker holds nothing, closing session"
            );
            self.unsubscribe().await;
            if let Err(e) = self.deps.store.delete(self.session_id).await {
                error!(%ticker, ?e, "Failed to delete flat session");
            }
            return Some(MonitorOutcome::AlreadyFlat);
        }

        let mut quantity = self.session.quantity;
        if held < quantity {
            warn!(%ticker, stored = quantity, held, "Holding below stored quantity, clamping");
            self.deps.notifier.notify(Alert::warning(
                AlertKind::HoldingMismatch,
                ticker.as_str(),
                format!("stored {quantity}, broker holds {held}; selling {held}"),
            ));
            quantity = held;
        }

        self.cancel_open_sells().await;

        let request = ExitRequest::for_session(&self.session, quantity, safe_price, reason);
        match self.deps.executor.execute_exit(&request).await {
            Ok(report) => {
                self.unsubscribe().await;
                info!(%ticker, %reason, sold = report.sold, "Exit executed");
                Some(self.confirm_flat(report.session_remaining).await)
            }
            Err(e) => self.resume_after_failure(e).await,
        }
    }

    /// Balance check after a successful exit.
    async fn confirm_flat(&mut self, session_remaining: Option<u64>) -> MonitorOutcome {
        let ticker = self.ticker().clone();
        match self.verify_holding().await {
            Ok(0) => {
                if session_remaining.is_some() {
                    // Clamped exit: the stored remainder was never held.
                    if let Err(e) = self.deps.store.delete(self.session_id).await {
                        error!(%ticker, ?e, "Failed to delete session after exit");
                    }
                }
                MonitorOutcome::Exited
            }
            Ok(remaining) => {
                self.deps.notifier.notify(Alert::critical(
                    AlertKind::ResidualHolding,
                    ticker.as_str(),
                    format!("{remaining} shares still held after exit"),
                ));
                MonitorOutcome::ResidualHolding { remaining }
            }
            Err(e) => {
                self.deps.notifier.notify(Alert::warning(
                    AlertKind::ResidualHolding,
                    ticker.as_str(),
                    format!("could not confirm flat position: {e}"),
                ));
                MonitorOutcome::Exited
            }
        }
    }

    async fn resume_after_failure(&mut self, e: ExecutorError) -> Option<MonitorOutcome> {
        let ticker = self.ticker().clone();
        let kind = match e.cause() {
            ExecutorError::RateLimitExhausted { .. } => AlertKind::RateLimitExhausted,
            ExecutorError::ReconcileExhausted { .. } => AlertKind::ReconcileExhausted,
            _ => AlertKind::ExitFailed,
        };
        let message = format!("exit failed, monitoring resumes: {e}");
        let alert = if e.is_critical() {
            Alert::critical(kind, ticker.as_str(), message)
        } else {
            Alert::warning(kind, ticker.as_str(), message)
        };
        self.deps.notifier.notify(alert);

        match self.deps.store.get(self.session_id).await {
            Ok(Some(session)) if session.quantity > 0 => self.session = session,
            Ok(_) => {
                info!(%ticker, "Session closed by partial fills");
                self.unsubscribe().await;
                return Some(self.confirm_flat(None).await);
            }
            Err(e) => warn!(%ticker, ?e, "Session refresh failed, keeping last copy"),
        }

        if let Err(e) = self.deps.subscriptions.subscribe(&ticker).await {
            self.deps.notifier.notify(Alert::critical(
                AlertKind::ResubscribeFailed,
                ticker.as_str(),
                format!("position unwatched after failed exit: {e}"),
            ));
        }
        None
    }

    /// Broker quantity for the ticker, retried with a short backoff.
    async fn verify_holding(&self) -> PositionResult<u64> {
        let ticker = self.ticker();
        let attempts = self.config.holding_check_attempts.max(1);
        let backoff = Duration::from_millis(self.config.holding_check_backoff_ms);
        let mut attempt = 1;
        loop {
            match self.deps.broker.holding(ticker).await {
                Ok(holding) => return Ok(holding.map_or(0, |h| h.quantity)),
                Err(e) if attempt >= attempts => {
                    return Err(PositionError::HoldingCheck {
                        ticker: ticker.to_string(),
                        attempts,
                        source: e,
                    })
                }
                Err(e) => {
                    debug!(%ticker, attempt, ?e, "Holding check failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Cancel working sell orders so the exit does not oversell.
    async fn cancel_open_sells(&self) {
        let ticker = self.ticker();
        let orders = match self.deps.broker.open_orders(ticker).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(%ticker, ?e, "Open order inquiry failed");
                return;
            }
        };
        for order in orders.iter().filter(|o| o.side == OrderSide::Sell) {
            match self.deps.broker.cancel_order(&order.order_id).await {
                Ok(()) => info!(%ticker, order_id = %order.order_id, "Cancelled working sell"),
                Err(e) => warn!(%ticker, order_id = %order.order_id, ?e, "Cancel failed"),
            }
        }
    }

    async fn unsubscribe(&self) {
        let ticker = self.ticker();
        if let Err(e) = self.deps.subscriptions.unsubscribe(ticker).await {
            warn!(%ticker, ?e, "Unsubscribe failed");
        }
    }
}
