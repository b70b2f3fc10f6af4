//! Read-idle detection.
//!
//! The quote server sends a keepalive every few seconds even when no
//! subscribed ticker trades. A socket that goes silent for longer than the
//! idle timeout is treated as dead and the connection is recycled.

use parking_lot::RwLock;
use std::time::{Duration, Instant};

/// Tracks the time of the last inbound frame.
pub struct HeartbeatMonitor {
    idle_timeout: Duration,
    last_message: RwLock<Instant>,
}

impl HeartbeatMonitor {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            last_message: RwLock::new(Instant::now()),
        }
    }

    /// Reset on a fresh connection.
    pub fn reset(&self) {
        *self.last_message.write() = Instant::now();
    }

    /// Record that any frame was received.
    pub fn record_message(&self) {
        *self.last_message.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_message.read().elapsed()
    }

    pub fn is_timed_out(&self) -> bool {
        self.idle_for() >= self.idle_timeout
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Sleep until the next check is due.
    pub async fn wait_for_check(&self) {
        let remaining = self.idle_timeout.saturating_sub(self.idle_for());
        tokio::time::sleep(remaining.max(Duration::from_millis(50))).await;
    }
}
