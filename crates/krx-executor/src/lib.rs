//! Order execution for the KRX slot trader.
//!
//! Every broker call in the process goes through one [`BrokerHandle`], which
//! owns the global call semaphore and the bounded rate-limit retry.
//!
//! # Key Components
//!
//! - [`Broker`]: Brokerage order/account interface (async)
//! - [`BlockingBroker`]: Runs a synchronous [`SyncBroker`] on the blocking pool
//! - [`FillReconciler`]: Cancel/resubmit loop driving an order to full fill
//! - [`OrderExecutor`] / [`BrokerExitExecutor`]: Position exit capability
//! - [`EntryExecutor`]: Slot allocation and buy execution
//! - [`PaperBroker`]: Simulated broker for paper trading
//! - [`MockBroker`]: Scriptable broker for tests

pub mod blocking;
pub mod broker;
pub mod entry;
pub mod error;
pub mod exit;
pub mod fill;
pub mod mock;
pub mod paper;

pub use blocking::{BlockingBroker, SyncBroker};
pub use broker::{classify_rejection, Broker, BrokerConfig, BrokerHandle, DynBroker};
pub use entry::{fund_per_slot, EntryConfig, EntryExecutor, EntryOutcome, SkipReason};
pub use error::{ExecutorError, ExecutorResult};
pub use exit::{BrokerExitExecutor, DynOrderExecutor, ExitReport, ExitRequest, OrderExecutor};
pub use fill::{FillReconciler, ReconcileConfig, ReconcileRequest};
pub use mock::{MockBroker, Placement};
pub use paper::{PaperBroker, PaperBrokerConfig};
