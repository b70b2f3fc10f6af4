//! Per-ticker subscription registry.
//!
//! Each tracked ticker owns one bounded queue of raw quote frames. The
//! registry records two things per ticker:
//! - the queue sender plus a generation number, so a monitor that has been
//!   replaced can never release or reuse its successor's queue
//! - the desired wire membership (`subscribed`), which the connection loop
//!   reconciles against what is actually subscribed on the socket
//!
//! Mutations take a short `parking_lot` write lock; no await happens while
//! it is held.

use crate::error::{WsError, WsResult};
use krx_core::Ticker;
use krx_telemetry::Metrics;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Default per-ticker queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct Entry {
    generation: u64,
    subscribed: bool,
    tx: mpsc::Sender<String>,
}

/// Receiving side handed to a monitor by `register`.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub ticker: Ticker,
    pub generation: u64,
    pub rx: mpsc::Receiver<String>,
}

/// Outcome of routing one quote frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    /// No entry, or the entry is not subscribed.
    NotSubscribed,
    /// Queue full; frame dropped.
    QueueFull,
    /// Receiver gone; frame dropped.
    Closed,
}

/// Ticker → queue registry shared by the connection loop and monitors.
pub struct SubscriptionRegistry {
    entries: RwLock<HashMap<Ticker, Entry>>,
    next_generation: AtomicU64,
    queue_capacity: usize,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl SubscriptionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Create (or replace) the queue for `ticker`.
    ///
    /// Replacing drops the previous sender, so the previous receiver sees a
    /// closed queue once drained. Desired membership carries over.
    pub fn register(&self, ticker: Ticker) -> SubscriptionHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut entries = self.entries.write();
        let subscribed = match entries.get(&ticker) {
            Some(old) => {
                info!(
                    %ticker,
                    old_generation = old.generation,
                    generation,
                    "Replacing subscription queue"
                );
                old.subscribed
            }
            None => false,
        };
        entries.insert(
            ticker.clone(),
            Entry {
                generation,
                subscribed,
                tx,
            },
        );
        drop(entries);

        debug!(%ticker, generation, "Registered subscription queue");
        SubscriptionHandle {
            ticker,
            generation,
            rx,
        }
    }

    /// Remove the entry if `generation` is still current.
    ///
    /// Returns `Some(was_subscribed)` when removed, `None` for a stale or
    /// unknown generation.
    pub fn release(&self, ticker: &str, generation: u64) -> Option<bool> {
        let mut entries = self.entries.write();
        match entries.get(ticker) {
            Some(entry) if entry.generation == generation => {
                let was_subscribed = entry.subscribed;
                entries.remove(ticker);
                debug!(%ticker, generation, "Released subscription queue");
                Some(was_subscribed)
            }
            Some(entry) => {
                debug!(
                    %ticker,
                    generation,
                    current = entry.generation,
                    "Ignoring release of stale generation"
                );
                None
            }
            None => None,
        }
    }

    /// Record desired wire membership. Returns the previous value.
    pub fn set_subscribed(&self, ticker: &str, subscribed: bool) -> WsResult<bool> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(ticker)
            .ok_or_else(|| WsError::NotRegistered(ticker.to_string()))?;
        Ok(std::mem::replace(&mut entry.subscribed, subscribed))
    }

    pub fn is_subscribed(&self, ticker: &str) -> bool {
        self.entries
            .read()
            .get(ticker)
            .is_some_and(|e| e.subscribed)
    }

    pub fn is_registered(&self, ticker: &str) -> bool {
        self.entries.read().contains_key(ticker)
    }

    /// Whether `generation` still owns the entry for `ticker`.
    pub fn is_current(&self, ticker: &str, generation: u64) -> bool {
        self.entries
            .read()
            .get(ticker)
            .is_some_and(|e| e.generation == generation)
    }

    /// Snapshot of desired wire membership, sorted.
    pub fn subscribed_tickers(&self) -> BTreeSet<Ticker> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.subscribed)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Snapshot of every registered ticker, sorted.
    pub fn tracked_tickers(&self) -> Vec<Ticker> {
        let mut tickers: Vec<_> = self.entries.read().keys().cloned().collect();
        tickers.sort();
        tickers
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route one quote frame to its ticker's queue without waiting.
    pub fn dispatch(&self, ticker: &str, raw: &str) -> Dispatch {
        let entries = self.entries.read();
        let Some(entry) = entries.get(ticker).filter(|e| e.subscribed) else {
            return Dispatch::NotSubscribed;
        };
        match entry.tx.try_send(raw.to_string()) {
            Ok(()) => Dispatch::Delivered,
            Err(TrySendError::Full(_)) => {
                Metrics::queue_dropped(ticker);
                warn!(%ticker, "Monitor queue full, dropping quote");
                Dispatch::QueueFull
            }
            Err(TrySendError::Closed(_)) => Dispatch::Closed,
        }
    }
}
