//! Per-ticker exit locks.
//!
//! One async mutex per ticker serializes exit attempts. The map itself is
//! guarded by a short `parking_lot` lock that is never held across an await;
//! waiting happens on the per-ticker mutex only.
//!
//! Entries are created on first use and removed when the last guard drops
//! with nobody else waiting, or explicitly by `remove_if_unlocked` during
//! monitor teardown.

use crate::error::{PositionError, PositionResult};
use krx_core::Ticker;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

/// Default acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

type TickerLock = Arc<AsyncMutex<()>>;

/// Ticker → lock map.
#[derive(Debug)]
pub struct LockRegistry {
    locks: Mutex<HashMap<Ticker, TickerLock>>,
    timeout: Duration,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn entry(&self, ticker: &Ticker) -> TickerLock {
        self.locks
            .lock()
            .entry(ticker.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Acquire the lock for `ticker`, waiting at most the configured timeout.
    pub async fn acquire(self: &Arc<Self>, ticker: &Ticker) -> PositionResult<PositionLockGuard> {
        let lock = self.entry(ticker);
        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => {
                trace!(%ticker, "Position lock acquired");
                Ok(PositionLockGuard {
                    ticker: ticker.clone(),
                    registry: Arc::clone(self),
                    guard: Some(guard),
                })
            }
            Err(_) => Err(PositionError::LockTimeout {
                ticker: ticker.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Drop the entry for `ticker` if no one holds or waits on it.
    ///
    /// Returns whether an entry was removed.
    pub fn remove_if_unlocked(&self, ticker: &Ticker) -> bool {
        let mut locks = self.locks.lock();
        let Some(lock) = locks.get(ticker) else {
            return false;
        };
        // The map holds one reference; any other is a guard or a waiter.
        if Arc::strong_count(lock) > 1 || lock.try_lock().is_err() {
            return false;
        }
        locks.remove(ticker);
        debug!(%ticker, "Removed position lock entry");
        true
    }

    pub fn contains(&self, ticker: &Ticker) -> bool {
        self.locks.lock().contains_key(ticker)
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock for one ticker. Releases on drop.
#[derive(Debug)]
pub struct PositionLockGuard {
    ticker: Ticker,
    registry: Arc<LockRegistry>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PositionLockGuard {
    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }
}

impl Drop for PositionLockGuard {
    fn drop(&mut self) {
        // Release first so the entry looks idle to the cleanup below.
        drop(self.guard.take());
        self.registry.remove_if_unlocked(&self.ticker);
        trace!(ticker = %self.ticker, "Position lock released");
    }
}
