//! Persisted trading session (one managed position).
//!
//! A session is created when a slot is allocated and capital assigned,
//! mutated after every buy or sell fill and deleted once flat.

use crate::decimal::Price;
use crate::error::{CoreError, Result};
use crate::market::Ticker;
use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One managed position.
///
/// Invariant: `spent_fund <= fund`. Checked at construction and on every
/// buy; a violating update is refused and leaves the session unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub ticker: Ticker,
    pub name: String,
    pub quantity: u64,
    pub avg_price: Price,
    pub fund: Decimal,
    pub spent_fund: Decimal,
    /// Number of completed buy rounds.
    pub round: u32,
    pub start_date: NaiveDate,
    /// Date after which the position is force-exited.
    pub target_date: NaiveDate,
}

impl Session {
    /// Fresh, empty session holding `fund` of allocated capital.
    ///
    /// The id is left at its default until the store assigns one.
    pub fn open(
        ticker: Ticker,
        name: impl Into<String>,
        fund: Decimal,
        start_date: NaiveDate,
        max_holding_days: u32,
    ) -> Result<Self> {
        if fund <= Decimal::ZERO {
            return Err(CoreError::InvalidSession(format!(
                "{ticker}: fund must be positive, got {fund}"
            )));
        }
        let target_date = start_date
            .checked_add_days(Days::new(u64::from(max_holding_days)))
            .ok_or_else(|| {
                CoreError::InvalidSession(format!("{ticker}: target date out of range"))
            })?;
        Ok(Self {
            id: SessionId::default(),
            ticker,
            name: name.into(),
            quantity: 0,
            avg_price: Price::ZERO,
            fund,
            spent_fund: Decimal::ZERO,
            round: 0,
            start_date,
            target_date,
        })
    }

    /// Validate a session loaded from storage.
    pub fn validate(&self) -> Result<()> {
        if self.spent_fund > self.fund {
            return Err(CoreError::InvalidSession(format!(
                "{}: spent_fund {} exceeds fund {}",
                self.ticker, self.spent_fund, self.fund
            )));
        }
        if self.target_date < self.start_date {
            return Err(CoreError::InvalidSession(format!(
                "{}: target_date {} before start_date {}",
                self.ticker, self.target_date, self.start_date
            )));
        }
        Ok(())
    }

    /// Capital not yet spent.
    #[must_use]
    pub fn remaining_fund(&self) -> Decimal {
        self.fund - self.spent_fund
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.quantity == 0
    }

    /// Apply a completed buy round.
    pub fn apply_buy(&mut self, filled: u64, fill_price: Price) -> Result<()> {
        if filled == 0 {
            return Ok(());
        }
        let cost = fill_price.notional(filled);
        let spent = self.spent_fund + cost;
        if spent > self.fund {
            return Err(CoreError::InvalidSession(format!(
                "{}: buy of {filled} @ {fill_price} would spend {spent} of {}",
                self.ticker, self.fund
            )));
        }
        let held_cost = self.avg_price.notional(self.quantity);
        let quantity = self.quantity + filled;
        self.avg_price = Price::new((held_cost + cost) / Decimal::from(quantity));
        self.quantity = quantity;
        self.spent_fund = spent;
        self.round += 1;
        Ok(())
    }

    /// Apply a sell fill. Returns the quantity still held.
    pub fn apply_sell(&mut self, filled: u64) -> u64 {
        self.quantity = self.quantity.saturating_sub(filled);
        self.quantity
    }
}
