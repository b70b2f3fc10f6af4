//! Position management for the KRX slot trader.
//!
//! Watches every managed holding and closes it when an exit rule fires.
//!
//! # Key Components
//!
//! - [`ExitRule`]: Turns one quote frame into a [`Verdict`] (profit, stop-loss, expiry)
//! - [`LockRegistry`]: Per-ticker exit locks with bounded acquisition
//! - [`spawn_monitor`]: Starts one [`MonitorHandle`]-controlled task per session
//! - [`Clock`]: Exchange-local time source ([`KstClock`], [`FixedClock`])

pub mod clock;
pub mod error;
pub mod exit_rule;
pub mod lock_registry;
pub mod monitor;

pub use clock::{Clock, DynClock, FixedClock, KstClock};
pub use error::{PositionError, PositionResult};
pub use exit_rule::{decide, ExitRule, ExitRuleConfig, Verdict};
pub use lock_registry::{LockRegistry, PositionLockGuard, DEFAULT_LOCK_TIMEOUT};
pub use monitor::{
    release_monitor_resources, spawn_monitor, MonitorConfig, MonitorDeps, MonitorHandle,
    MonitorOutcome, MonitorReport, MonitorState,
};
