//! Prometheus metrics, structured logging and alerting for the KRX slot trader.
//!
//! - Structured logging with tracing (JSON in production)
//! - Prometheus metrics for the streaming client, monitors and orders
//! - `Notifier` seam for operator alerts
//! - `LogThrottle` for rate-limited log lines

pub mod alert;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod throttle;

pub use alert::{Alert, AlertKind, AlertSeverity, MemoryNotifier, Notifier, TracingNotifier};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, DEFAULT_FILTER};
pub use metrics::Metrics;
pub use throttle::LogThrottle;
