//! Entry path: slot allocation and buy execution.
//!
//! Capital is split across a fixed number of slots. A new position gets
//! `available cash / free slots` (optionally capped), buys
//! `trunc(fund / price)` shares with a limit order and is persisted as a
//! session before the order goes out, so a crash mid-execution leaves a
//! record to reconcile against.
//!
//! # Rejections
//!
//! - First order of a fresh session refused (or nothing filled): the
//!   session is deleted.
//! - Later rounds refused: the error surfaces and the session keeps its
//!   history plus whatever did fill.

use crate::broker::BrokerHandle;
use crate::error::{ExecutorError, ExecutorResult};
use crate::fill::{FillReconciler, ReconcileRequest};
use chrono::NaiveDate;
use krx_core::{
    average_fill_price, filled_total, OrderAttempt, OrderSide, Price, Session, SessionId, Ticker,
};
use krx_persistence::{DynSessionStore, PersistenceError, TradeJournal, TradeRecord};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Slot and sizing limits.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryConfig {
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,
    /// Upper bound on capital per slot. `None` means no cap.
    #[serde(default)]
    pub max_fund_per_slot: Option<Decimal>,
    /// Calendar days until a new session's forced exit.
    #[serde(default = "default_max_holding_days")]
    pub max_holding_days: u32,
}

fn default_max_slots() -> usize {
    5
}

fn default_max_holding_days() -> u32 {
    10
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            max_slots: default_max_slots(),
            max_fund_per_slot: None,
            max_holding_days: default_max_holding_days(),
        }
    }
}

/// Why an entry was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoFreeSlot,
    AlreadyHeld,
    /// Allocated fund buys less than one share.
    ZeroQuantity,
}

/// Result of an entry attempt that did not error.
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    Opened {
        session: Session,
        attempts: Vec<OrderAttempt>,
    },
    Skipped {
        ticker: Ticker,
        reason: SkipReason,
    },
}

/// Capital for one new slot: cash split evenly across the free slots,
/// capped by `cap`. Zero when no slot is free.
pub fn fund_per_slot(cash: Decimal, free_slots: usize, cap: Option<Decimal>) -> Decimal {
    if free_slots == 0 || cash <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let share = cash / Decimal::from(free_slots as u64);
    match cap {
        Some(cap) => share.min(cap),
        None => share,
    }
}

pub struct EntryExecutor {
    broker: BrokerHandle,
    reconciler: FillReconciler,
    store: DynSessionStore,
    journal: Option<Arc<TradeJournal>>,
    config: EntryConfig,
}

impl EntryExecutor {
    pub fn new(reconciler: FillReconciler, store: DynSessionStore, config: EntryConfig) -> Self {
        Self {
            broker: reconciler.broker().clone(),
            reconciler,
            store,
            journal: None,
            config,
        }
    }

    pub fn with_journal(mut self, journal: Arc<TradeJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &EntryConfig {
        &self.config
    }

    /// Slots not occupied by a stored session.
    pub async fn free_slots(&self) -> ExecutorResult<usize> {
        let open = self.store.list_all().await?.len();
        Ok(self.config.max_slots.saturating_sub(open))
    }

    /// Open a new position in `ticker` at limit `price`.
    ///
    /// # Errors
    ///
    /// `OrderRejected` / `RateLimitExhausted` / `ReconcileExhausted` /
    /// `Interrupted` from the buy, store errors. The fresh session is deleted
    /// only when nothing filled and no order can still be working; otherwise
    /// the recorded fills are applied before the error is returned.
    pub async fn enter(
        &self,
        ticker: &Ticker,
        name: &str,
        price: Price,
        today: NaiveDate,
    ) -> ExecutorResult<EntryOutcome> {
        if !price.is_positive() {
            return Err(ExecutorError::InvalidOrder(format!(
                "{ticker}: non-positive price {price}"
            )));
        }

        let sessions = self.store.list_all().await?;
        if sessions.iter().any(|s| &s.ticker == ticker) {
            debug!(%ticker, "Already held, skipping entry");
            return Ok(skipped(ticker, SkipReason::AlreadyHeld));
        }
        let free = self.config.max_slots.saturating_sub(sessions.len());
        if free == 0 {
            debug!(%ticker, max_slots = self.config.max_slots, "No free slot");
            return Ok(skipped(ticker, SkipReason::NoFreeSlot));
        }

        let cash = self.broker.get_available_cash().await?;
        let fund = fund_per_slot(cash, free, self.config.max_fund_per_slot);
        let quantity = price.affordable_quantity(fund);
        if quantity == 0 {
            info!(%ticker, %fund, %price, "Slot fund buys no shares, skipping");
            return Ok(skipped(ticker, SkipReason::ZeroQuantity));
        }

        let session = Session::open(
            ticker.clone(),
            name,
            fund,
            today,
            self.config.max_holding_days,
        )?;
        let session = self.store.insert(session).await?;
        info!(
            %ticker,
            session_id = %session.id,
            %fund,
            quantity,
            %price,
            free_slots = free,
            "Opening position"
        );

        match self.buy(&session, quantity, price).await {
            Ok(attempts) => {
                let session = self.apply_fills(session, &attempts).await?;
                self.journal(&session, quantity, &attempts, None);
                Ok(EntryOutcome::Opened { session, attempts })
            }
            Err(e) => {
                let attempts = e.attempts().to_vec();
                self.journal(&session, quantity, &attempts, Some(&e));
                let unknown_state = matches!(e, ExecutorError::Interrupted { .. });
                if filled_total(&attempts) == 0 && !unknown_state {
                    warn!(
                        %ticker,
                        session_id = %session.id,
                        error = %e,
                        "First order failed, deleting session"
                    );
                    self.store.delete(session.id).await?;
                } else {
                    warn!(
                        %ticker,
                        session_id = %session.id,
                        filled = filled_total(&attempts),
                        error = %e,
                        "First order left fills or an unknown order state, keeping session"
                    );
                    self.apply_fills(session, &attempts).await?;
                }
                Err(e)
            }
        }
    }

    /// Additional buy round on an existing session, spending at most
    /// `fund` of its remaining capital.
    ///
    /// # Errors
    ///
    /// Order and store errors. The session is never deleted here; partial
    /// fills are applied before the error is returned.
    pub async fn buy_more(
        &self,
        session_id: SessionId,
        price: Price,
        fund: Decimal,
    ) -> ExecutorResult<Vec<OrderAttempt>> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or(PersistenceError::NotFound(session_id))?;
        let quantity = price.affordable_quantity(fund.min(session.remaining_fund()));
        if quantity == 0 {
            return Err(ExecutorError::InvalidOrder(format!(
                "{}: remaining fund {} buys no shares at {price}",
                session.ticker,
                session.remaining_fund()
            )));
        }

        let result = self.buy(&session, quantity, price).await;
        let attempts = match &result {
            Ok(attempts) => attempts.clone(),
            Err(e) => e.attempts().to_vec(),
        };
        self.journal(&session, quantity, &attempts, result.as_ref().err());
        self.apply_fills(session, &attempts).await?;
        result
    }

    async fn buy(
        &self,
        session: &Session,
        quantity: u64,
        price: Price,
    ) -> ExecutorResult<Vec<OrderAttempt>> {
        let placed = self
            .broker
            .place_order(&session.ticker, quantity, OrderSide::Buy, Some(price))
            .await?;
        let request = ReconcileRequest {
            ticker: session.ticker.clone(),
            side: OrderSide::Buy,
            price: Some(price),
            requested: quantity,
        };
        self.reconciler.reconcile(&request, placed).await
    }

    /// Fold filled legs into the session and persist it.
    async fn apply_fills(
        &self,
        mut session: Session,
        attempts: &[OrderAttempt],
    ) -> ExecutorResult<Session> {
        let filled = filled_total(attempts);
        let Some(avg) = average_fill_price(attempts) else {
            return Ok(session);
        };
        session.apply_buy(filled, avg)?;
        self.store.update(session.clone()).await?;
        info!(
            ticker = %session.ticker,
            session_id = %session.id,
            filled,
            avg_price = %session.avg_price,
            round = session.round,
            "Buy round applied"
        );
        Ok(session)
    }

    fn journal(
        &self,
        session: &Session,
        requested: u64,
        attempts: &[OrderAttempt],
        err: Option<&ExecutorError>,
    ) {
        let Some(journal) = &self.journal else {
            return;
        };
        let mut record = TradeRecord::new(
            session.id,
            session.ticker.clone(),
            OrderSide::Buy,
            "entry",
            requested,
            attempts.to_vec(),
        );
        if let Some(e) = err {
            record = record.with_error(e.to_string());
        }
        if let Err(e) = journal.append(&record) {
            warn!(ticker = %session.ticker, ?e, "Failed to journal entry");
        }
    }
}

fn skipped(ticker: &Ticker, reason: SkipReason) -> EntryOutcome {
    EntryOutcome::Skipped {
        ticker: ticker.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::fill::ReconcileConfig;
    use crate::mock::MockBroker;
    use krx_persistence::{InMemorySessionStore, SessionStore};
    use rust_decimal_macros::dec;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
    }

    fn setup(config: EntryConfig) -> (Arc<MockBroker>, Arc<InMemorySessionStore>, EntryExecutor) {
        let mock = Arc::new(MockBroker::new());
        let store = Arc::new(InMemorySessionStore::new());
        let reconciler = FillReconciler::new(
            BrokerHandle::new(mock.clone(), BrokerConfig::default()),
            ReconcileConfig {
                settle_delay_ms: 0,
                pacing_delay_ms: 0,
                max_rounds: 5,
            },
        );
        let executor = EntryExecutor::new(reconciler, store.clone(), config);
        (mock, store, executor)
    }

    #[test]
    fn test_fund_per_slot() {
        assert_eq!(fund_per_slot(dec!(3_000_000), 3, None), dec!(1_000_000));
        assert_eq!(fund_per_slot(dec!(3_000_000), 3, Some(dec!(500_000))), dec!(500_000));
        assert_eq!(fund_per_slot(dec!(3_000_000), 0, None), Decimal::ZERO);
        assert_eq!(fund_per_slot(dec!(-5), 2, None), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_entry_sizes_by_truncation() {
        let (mock, store, executor) = setup(EntryConfig {
            max_slots: 2,
            max_fund_per_slot: None,
            max_holding_days: 10,
        });
        mock.set_cash(dec!(2_000_000));

        // 1_000_000 / 71_200 = 14.04 -> 14 shares.
        let outcome = executor
            .enter(&Ticker::from("005930"), "Samsung Electronics", Price::from_krw(71_200), today())
            .await
            .unwrap();

        let EntryOutcome::Opened { session, attempts } = outcome else {
            panic!("expected an opened position");
        };
        assert_eq!(filled_total(&attempts), 14);
        assert_eq!(session.quantity, 14);
        assert_eq!(session.round, 1);
        assert_eq!(session.fund, dec!(1_000_000));
        assert_eq!(session.spent_fund, dec!(996_800));
        assert_eq!(session.target_date, NaiveDate::from_ymd_opt(2026, 3, 12).unwrap());
        assert_eq!(store.get(session.id).await.unwrap().unwrap(), session);
    }

    #[tokio::test]
    async fn test_partial_fills_applied_once() {
        let (mock, _store, executor) = setup(EntryConfig::default());
        mock.set_cash(dec!(5_000_000));
        mock.script_fills(&[40]);
        mock.script_fills(&[60]);

        // 1_000_000 / 10_000 = 100 shares, filled 40 then 60.
        let outcome = executor
            .enter(&Ticker::from("000660"), "SK hynix", Price::from_krw(10_000), today())
            .await
            .unwrap();
        let EntryOutcome::Opened { session, attempts } = outcome else {
            panic!("expected an opened position");
        };
        assert_eq!(attempts.len(), 2);
        assert_eq!(session.quantity, 100);
        assert_eq!(session.round, 1);
    }

    #[tokio::test]
    async fn test_first_order_rejection_deletes_session() {
        let (mock, store, executor) = setup(EntryConfig::default());
        mock.set_cash(dec!(5_000_000));
        mock.reject_next("주문가능금액을 초과했습니다");

        let err = executor
            .enter(&Ticker::from("005930"), "Samsung Electronics", Price::from_krw(71_200), today())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::OrderRejected { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_buy_keeps_filled_shares() {
        let (mock, store, executor) = setup(EntryConfig::default());
        mock.set_cash(dec!(5_000_000));
        mock.script_fills(&[40]);
        mock.fail_cancel_next(1);

        // 100 shares requested, 40 bought before the cancel call fails.
        let err = executor
            .enter(&Ticker::from("000660"), "SK hynix", Price::from_krw(10_000), today())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Interrupted { .. }));
        assert!(err.is_critical());
        assert_eq!(mock.held("000660"), 40);

        let sessions = store.list_all().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].quantity, 40);
        assert_eq!(sessions[0].avg_price, Price::from_krw(10_000));
    }

    #[tokio::test]
    async fn test_later_rejection_keeps_history() {
        let (mock, store, executor) = setup(EntryConfig::default());
        mock.set_cash(dec!(5_000_000));
        // 1_000_000 / 30_000 -> 33 shares, 10_000 of the fund left over.
        let EntryOutcome::Opened { session, .. } = executor
            .enter(&Ticker::from("005930"), "Samsung Electronics", Price::from_krw(30_000), today())
            .await
            .unwrap()
        else {
            panic!("expected an opened position");
        };

        mock.reject_next("trading halted");
        let err = executor
            .buy_more(session.id, Price::from_krw(10_000), dec!(100_000))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::OrderRejected { .. }));

        let stored = store.get(session.id).await.unwrap().unwrap();
        assert_eq!(stored, session);
    }

    #[tokio::test]
    async fn test_slots_and_duplicates_skip() {
        let (mock, _store, executor) = setup(EntryConfig {
            max_slots: 1,
            max_fund_per_slot: None,
            max_holding_days: 10,
        });
        mock.set_cash(dec!(1_000_000));
        executor
            .enter(&Ticker::from("005930"), "Samsung Electronics", Price::from_krw(10_000), today())
            .await
            .unwrap();

        let again = executor
            .enter(&Ticker::from("005930"), "Samsung Electronics", Price::from_krw(10_000), today())
            .await
            .unwrap();
        assert!(matches!(
            again,
            EntryOutcome::Skipped { reason: SkipReason::AlreadyHeld, .. }
        ));

        let full = executor
            .enter(&Ticker::from("000660"), "SK hynix", Price::from_krw(10_000), today())
            .await
            .unwrap();
        assert!(matches!(
            full,
            EntryOutcome::Skipped { reason: SkipReason::NoFreeSlot, .. }
        ));
        assert_eq!(executor.free_slots().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_quantity_skips_without_session() {
        let (mock, store, executor) = setup(EntryConfig::default());
        mock.set_cash(dec!(100_000));

        // 100_000 / 5 slots = 20_000 < one share at 71_200.
        let outcome = executor
            .enter(&Ticker::from("005930"), "Samsung Electronics", Price::from_krw(71_200), today())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            EntryOutcome::Skipped { reason: SkipReason::ZeroQuantity, .. }
        ));
        assert!(store.is_empty());
        assert!(mock.placements().is_empty());
    }
}
