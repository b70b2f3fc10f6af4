//! Operator alerts.
//!
//! Per-instrument failures never crash the process; the ones an operator
//! must act on (a position left open, a lost subscription) are raised
//! through a `Notifier`. Delivery channels beyond logs live outside this
//! workspace and plug in behind the trait.

use crate::metrics::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tracing::{error, warn};

/// Severity level of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum AlertSeverity {
    /// Attention recommended.
    Warning,
    /// Action required: position or subscription state is unsafe.
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlertKind {
    /// Shares remain after an exit reported success.
    ResidualHolding,
    /// Re-subscribing after a failed exit failed; the position is unwatched.
    ResubscribeFailed,
    /// An exit attempt failed and monitoring resumed.
    ExitFailed,
    /// Fill reconciliation hit its round ceiling.
    ReconcileExhausted,
    /// Broker kept throttling past the retry ceiling.
    RateLimitExhausted,
    /// Stored quantity disagrees with the broker.
    HoldingMismatch,
    /// Entry order failed.
    EntryFailed,
    /// A monitor task ended abnormally.
    MonitorCrashed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResidualHolding => "residual_holding",
            Self::ResubscribeFailed => "resubscribe_failed",
            Self::ExitFailed => "exit_failed",
            Self::ReconcileExhausted => "reconcile_exhausted",
            Self::RateLimitExhausted => "rate_limit_exhausted",
            Self::HoldingMismatch => "holding_mismatch",
            Self::EntryFailed => "entry_failed",
            Self::MonitorCrashed => "monitor_crashed",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub ticker: Option<String>,
    pub message: String,
}

impl Alert {
    pub fn critical(
        kind: AlertKind,
        ticker: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity: AlertSeverity::Critical,
            ticker: Some(ticker.into()),
            message: message.into(),
        }
    }

    pub fn warning(kind: AlertKind, ticker: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: AlertSeverity::Warning,
            ticker: Some(ticker.into()),
            message: message.into(),
        }
    }
}

/// Alert sink.
///
/// Called from monitor tasks; implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Notifier that writes alerts to the log and counts them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, alert: Alert) {
        Metrics::alert_raised(alert.kind.as_str(), alert.severity.as_str());
        let ticker = alert.ticker.as_deref().unwrap_or("-");
        match alert.severity {
            AlertSeverity::Critical => error!(
                kind = %alert.kind,
                ticker = %ticker,
                "CRITICAL: {}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                kind = %alert.kind,
                ticker = %ticker,
                "{}",
                alert.message
            ),
        }
    }
}

/// Notifier that keeps alerts in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts.lock().iter().filter(|a| a.kind == kind).count()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}
