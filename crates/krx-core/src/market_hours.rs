//! Exchange hours in Korea Standard Time.
//!
//! KRX regular trading runs on weekdays in local time (UTC+9, no DST).
//! Exit decisions only act inside the configured window; outside it a
//! monitor holds and waits.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// KST offset from UTC in seconds.
pub const KST_OFFSET_SECS: i32 = 9 * 3600;

/// Current wall-clock time in KST as a naive local datetime.
#[must_use]
pub fn kst_now() -> NaiveDateTime {
    to_kst(Utc::now())
}

/// Convert a UTC instant to naive KST local time.
#[must_use]
pub fn to_kst(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc() + Duration::seconds(i64::from(KST_OFFSET_SECS))
}

/// Daily trading window plus the end-of-day cutoff used for expiry exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingWindow {
    /// First local time at which exits may act.
    pub open: NaiveTime,
    /// Local time after which exits stop acting.
    pub close: NaiveTime,
    /// Local time from which an expired session is force-exited.
    pub eod_exit: NaiveTime,
}

impl Default for TradingWindow {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(15, 20, 0).unwrap_or(NaiveTime::MIN),
            eod_exit: NaiveTime::from_hms_opt(15, 10, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl TradingWindow {
    #[must_use]
    pub fn new(open: NaiveTime, close: NaiveTime, eod_exit: NaiveTime) -> Self {
        Self {
            open,
            close,
            eod_exit,
        }
    }

    /// True on weekdays between `open` (inclusive) and `close` (exclusive).
    #[must_use]
    pub fn contains(&self, now: NaiveDateTime) -> bool {
        if is_weekend(now) {
            return false;
        }
        let t = now.time();
        t >= self.open && t < self.close
    }

    /// True once the end-of-day exit cutoff has been reached.
    #[must_use]
    pub fn past_eod_exit(&self, now: NaiveDateTime) -> bool {
        now.time() >= self.eod_exit
    }
}

fn is_weekend(dt: NaiveDateTime) -> bool {
    matches!(dt.weekday(), Weekday::Sat | Weekday::Sun)
}
