//! JSON Lines trade journal.
//!
//! Every completed (or abandoned) execution is appended as one line:
//! - Each line is a complete JSON object
//! - Partial file corruption only affects individual lines
//! - Files rotate on the KST calendar date
//!
//! The journal is shared between monitor tasks, so writes go through an
//! internal lock and take `&self`.

use crate::error::PersistenceResult;
use chrono::NaiveDate;
use krx_core::{filled_total, kst_now, OrderAttempt, OrderSide, SessionId, Ticker};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// One execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp_ms: i64,
    pub session_id: SessionId,
    pub ticker: Ticker,
    pub side: OrderSide,
    /// Exit reason or `"entry"`.
    pub reason: String,
    pub requested: u64,
    pub filled: u64,
    pub attempts: Vec<OrderAttempt>,
    /// Terminal error, if the execution did not complete.
    pub error: Option<String>,
}

impl TradeRecord {
    pub fn new(
        session_id: SessionId,
        ticker: Ticker,
        side: OrderSide,
        reason: impl Into<String>,
        requested: u64,
        attempts: Vec<OrderAttempt>,
    ) -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            session_id,
            ticker,
            side,
            reason: reason.into(),
            requested,
            filled: filled_total(&attempts),
            attempts,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Active writer state for daily file.
struct ActiveWriter {
    writer: BufWriter<File>,
    date: NaiveDate,
    records_written: usize,
}

/// Append-only trade journal.
pub struct TradeJournal {
    base_dir: PathBuf,
    active: Mutex<Option<ActiveWriter>>,
}

impl TradeJournal {
    /// Create a journal writing under `base_dir`, creating it if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> PersistenceResult<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            active: Mutex::new(None),
        })
    }

    /// Append one record and flush it to disk.
    pub fn append(&self, record: &TradeRecord) -> PersistenceResult<()> {
        self.append_on(kst_now().date(), record)
    }

    fn append_on(&self, today: NaiveDate, record: &TradeRecord) -> PersistenceResult<()> {
        let json = serde_json::to_string(record)?;
        let mut guard = self.active.lock();

        if guard.as_ref().is_some_and(|w| w.date != today) {
            close_writer(guard.take());
        }

        if guard.is_none() {
            *guard = Some(self.open_writer(today)?);
        }
        if let Some(active) = guard.as_mut() {
            writeln!(active.writer, "{json}")?;
            active.writer.flush()?;
            active.records_written += 1;
        }

        debug!(
            date = %today,
            ticker = %record.ticker,
            filled = record.filled,
            "Journaled trade"
        );
        Ok(())
    }

    fn open_writer(&self, date: NaiveDate) -> PersistenceResult<ActiveWriter> {
        let filename = self
            .base_dir
            .join(format!("trades_{}.jsonl", date.format("%Y-%m-%d")));

        info!(filename = %filename.display(), "Opening trade journal (append mode)");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)?;

        Ok(ActiveWriter {
            writer: BufWriter::new(file),
            date,
            records_written: 0,
        })
    }
}

fn close_writer(active: Option<ActiveWriter>) {
    if let Some(mut active) = active {
        if let Err(e) = active.writer.flush() {
            warn!(?e, "Failed to flush journal on close");
        }
        info!(
            date = %active.date,
            records = active.records_written,
            "Closed trade journal"
        );
    }
}

impl Drop for TradeJournal {
    fn drop(&mut self) {
        close_writer(self.active.get_mut().take());
    }
}
