//! Local-time source for exit decisions.

use chrono::{Duration, NaiveDateTime};
use krx_core::kst_now;
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of the current exchange-local (KST) time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Arc wrapper for Clock trait objects.
pub type DynClock = Arc<dyn Clock>;

/// Wall clock converted to KST.
#[derive(Debug, Clone, Copy, Default)]
pub struct KstClock;

impl Clock for KstClock {
    fn now(&self) -> NaiveDateTime {
        kst_now()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock(Mutex<NaiveDateTime>);

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.0.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.0.lock()
    }
}
