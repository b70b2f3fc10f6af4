//! Rate-limited logging.
//!
//! A monitor sitting outside trading hours sees every quote frame and would
//! otherwise log each one. `LogThrottle` lets one line through per interval
//! and counts the rest.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct LogThrottle {
    last_log_time: Option<Instant>,
    suppressed_count: u64,
    interval: Duration,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_log_time: None,
            suppressed_count: 0,
            interval,
        }
    }

    /// Returns true if a line may be emitted now. Otherwise bumps the
    /// suppressed counter.
    pub fn should_log(&mut self) -> bool {
        self.should_log_at(Instant::now())
    }

    fn should_log_at(&mut self, now: Instant) -> bool {
        match self.last_log_time {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed_count += 1;
                false
            }
            _ => {
                self.last_log_time = Some(now);
                true
            }
        }
    }

    /// Suppressed lines since the last emitted one; resets the counter.
    pub fn take_suppressed(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed_count)
    }
}
