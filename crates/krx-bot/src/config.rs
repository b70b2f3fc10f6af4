//! Application configuration.
//!
//! Loaded from TOML. Every section is optional; missing values fall back to
//! the defaults of the crate that owns them. The streaming approval key is
//! never stored in the file, only the name of the environment variable
//! holding it.

use crate::error::{AppError, AppResult};
use krx_core::{Price, Ticker};
use krx_executor::{BrokerConfig, EntryConfig, PaperBrokerConfig, ReconcileConfig};
use krx_position::MonitorConfig;
use krx_ws::{ConnectionConfig, DEFAULT_TR_ID};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable consulted when no `--config` is given.
pub const CONFIG_ENV: &str = "KRX_CONFIG";

/// Config path used when neither `--config` nor `KRX_CONFIG` is set.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Streaming connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    #[serde(default = "default_ws_url")]
    pub url: String,
    #[serde(default = "default_tr_id")]
    pub tr_id: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Maximum consecutive reconnection attempts (0 = infinite).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Environment variable holding the approval key.
    #[serde(default = "default_approval_key_env")]
    pub approval_key_env: String,
}

fn default_ws_url() -> String {
    "ws://ops.koreainvestment.com:21000".to_string()
}

fn default_tr_id() -> String {
    DEFAULT_TR_ID.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    256
}

fn default_approval_key_env() -> String {
    "KRX_APPROVAL_KEY".to_string()
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            tr_id: default_tr_id(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            queue_capacity: default_queue_capacity(),
            approval_key_env: default_approval_key_env(),
        }
    }
}

impl From<WsConfig> for ConnectionConfig {
    fn from(cfg: WsConfig) -> Self {
        Self {
            url: cfg.url,
            tr_id: cfg.tr_id,
            connect_timeout_ms: cfg.connect_timeout_ms,
            idle_timeout_ms: cfg.idle_timeout_ms,
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            queue_capacity: cfg.queue_capacity,
        }
    }
}

/// Where sessions and the trade journal live.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_sessions_path")]
    pub sessions_path: PathBuf,
    /// Trade journal directory. No journal when unset.
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,
}

fn default_sessions_path() -> PathBuf {
    PathBuf::from("./data/sessions.json")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            sessions_path: default_sessions_path(),
            journal_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_filter() -> String {
    krx_telemetry::DEFAULT_FILTER.to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

/// Candidate for a new slot at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchlistEntry {
    pub ticker: Ticker,
    #[serde(default)]
    pub name: String,
    /// Limit price for the buy.
    pub limit_price: Price,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub websocket: WsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub entry: EntryConfig,
    #[serde(default)]
    pub paper: PaperBrokerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Tickers to open at startup while slots are free.
    #[serde(default)]
    pub watchlist: Vec<WatchlistEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl AppConfig {
    /// Resolve the config path: explicit argument, then `KRX_CONFIG`, then
    /// the default path.
    pub fn resolve_path(explicit: Option<String>) -> PathBuf {
        explicit
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load from a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.websocket.url.is_empty() {
            return Err(AppError::Config("websocket.url is empty".to_string()));
        }
        if self.entry.max_slots == 0 {
            return Err(AppError::Config("entry.max_slots must be at least 1".to_string()));
        }
        let rule = &self.monitor.exit_rule;
        if rule.risk_mgmt_upper >= rule.selling_point_upper {
            return Err(AppError::Config(format!(
                "risk_mgmt_upper ({}) must be below selling_point_upper ({})",
                rule.risk_mgmt_upper, rule.selling_point_upper
            )));
        }
        for entry in &self.watchlist {
            if !entry.limit_price.is_positive() {
                return Err(AppError::Config(format!(
                    "watchlist {}: limit_price must be positive",
                    entry.ticker
                )));
            }
        }
        Ok(())
    }

    /// Approval key from the configured environment variable.
    pub fn approval_key(&self) -> AppResult<String> {
        let var = &self.websocket.approval_key_env;
        match std::env::var(var) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => Err(AppError::Config(format!("approval key not set in ${var}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.websocket.reconnect_base_delay_ms, 1_000);
        assert_eq!(config.websocket.approval_key_env, "KRX_APPROVAL_KEY");
        assert_eq!(config.broker.max_concurrent_calls, 1);
        assert_eq!(config.reconcile.max_rounds, 20);
        assert_eq!(config.monitor.queue_timeout_ms, 5_000);
        assert_eq!(config.locks.timeout_ms, 10_000);
        assert_eq!(config.entry.max_slots, 5);
        assert!(config.watchlist.is_empty());
        assert!(config.persistence.journal_dir.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_toml(
            r#"
            [websocket]
            url = "ws://127.0.0.1:21000"
            max_reconnect_attempts = 5

            [monitor.exit_rule]
            selling_point_upper = "1.03"
            risk_mgmt_upper = "0.95"

            [entry]
            max_slots = 3
            max_fund_per_slot = "2000000"

            [persistence]
            sessions_path = "/tmp/sessions.json"
            journal_dir = "/tmp/journal"

            [[watchlist]]
            ticker = "005930"
            name = "Samsung Electronics"
            limit_price = "71200"
            "#,
        )
        .unwrap();

        let conn: ConnectionConfig = config.websocket.clone().into();
        assert_eq!(conn.url, "ws://127.0.0.1:21000");
        assert_eq!(conn.max_reconnect_attempts, 5);
        assert_eq!(config.monitor.exit_rule.selling_point_upper, dec!(1.03));
        assert_eq!(config.entry.max_fund_per_slot, Some(dec!(2000000)));
        assert_eq!(config.watchlist[0].ticker.as_str(), "005930");
        assert_eq!(config.watchlist[0].limit_price, Price::from_krw(71_200));
    }

    #[test]
    fn test_sample_config_parses() {
        let config = AppConfig::from_toml(include_str!("../../../config/default.toml")).unwrap();
        assert_eq!(config.websocket.tr_id, DEFAULT_TR_ID);
        assert_eq!(config.monitor.exit_rule.risk_mgmt_upper, dec!(0.93));
        assert_eq!(
            config.persistence.journal_dir,
            Some(PathBuf::from("./data/journal"))
        );
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let err = AppConfig::from_toml(
            r#"
            [monitor.exit_rule]
            selling_point_upper = "0.90"
            risk_mgmt_upper = "0.95"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_zero_slots_rejected() {
        assert!(AppConfig::from_toml("[entry]\nmax_slots = 0").is_err());
    }

    #[test]
    fn test_approval_key_from_env() {
        let mut config = AppConfig::default();
        config.websocket.approval_key_env = "KRX_TEST_APPROVAL_KEY_UNSET".to_string();
        assert!(config.approval_key().is_err());

        config.websocket.approval_key_env = "KRX_TEST_APPROVAL_KEY".to_string();
        std::env::set_var("KRX_TEST_APPROVAL_KEY", " abc ");
        assert_eq!(config.approval_key().unwrap(), "abc");
    }

    #[test]
    fn test_resolve_path_prefers_explicit() {
        assert_eq!(
            AppConfig::resolve_path(Some("custom.toml".to_string())),
            PathBuf::from("custom.toml")
        );
    }
}
