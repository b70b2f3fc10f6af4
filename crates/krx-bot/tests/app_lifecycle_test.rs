//! Application lifecycle integration tests.
//!
//! Tests the orchestrator end to end:
//! - Stored session monitored, exited and reported
//! - Sessions without shares are not monitored
//! - Watchlist entry opens a session and starts its monitor
//! - Shutdown stops every monitor and the client

mod integration;
use integration::common::mock_ws::MockWsServer;

use chrono::{NaiveDate, NaiveDateTime};
use krx_bot::config::WatchlistEntry;
use krx_bot::{AppConfig, Application, RunSummary, Services};
use krx_core::{OrderSide, Price, Session, Ticker};
use krx_executor::{MockBroker, ReconcileConfig};
use krx_persistence::{InMemorySessionStore, SessionStore};
use krx_position::{FixedClock, MonitorOutcome};
use krx_telemetry::MemoryNotifier;
use krx_ws::StaticApprovalKey;
use rust_decimal_macros::dec;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn quote(ticker: &str, ask: &str) -> String {
    let mut fields = vec![format!("0|H0STCNT0|001|{ticker}")];
    for i in 1..20 {
        fields.push(if i == 15 { ask.to_string() } else { i.to_string() });
    }
    fields.join("^")
}

/// March 2026: the 2nd is a Monday.
fn at(day: u32, hour: u32, min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, day)
        .unwrap()
        .and_hms_opt(hour, min, 0)
        .unwrap()
}

fn session(ticker: &str, quantity: u64) -> Session {
    let mut s = Session::open(
        Ticker::from(ticker),
        "test",
        dec!(10_000_000),
        NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
        10,
    )
    .unwrap();
    s.apply_buy(quantity, Price::from_krw(10_000)).unwrap();
    s
}

fn config_for(server: &MockWsServer) -> AppConfig {
    let mut config = AppConfig::default();
    config.websocket.url = server.url();
    config.websocket.reconnect_base_delay_ms = 10;
    config.websocket.reconnect_max_delay_ms = 50;
    config.monitor.queue_timeout_ms = 50;
    config.monitor.holding_check_backoff_ms = 5;
    config.reconcile = ReconcileConfig {
        settle_delay_ms: 0,
        pacing_delay_ms: 0,
        max_rounds: 5,
    };
    config
}

struct Fixture {
    broker: Arc<MockBroker>,
    store: Arc<InMemorySessionStore>,
    notifier: Arc<MemoryNotifier>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            broker: Arc::new(MockBroker::new()),
            store: Arc::new(InMemorySessionStore::new()),
            notifier: Arc::new(MemoryNotifier::new()),
        }
    }

    async fn hold(&self, ticker: &str, quantity: u64) {
        self.store.insert(session(ticker, quantity)).await.unwrap();
        self.broker
            .set_holding(ticker, quantity, Price::from_krw(10_000));
    }

    fn services(&self, now: NaiveDateTime) -> Services {
        Services {
            broker: self.broker.clone(),
            store: self.store.clone(),
            approval_keys: Arc::new(StaticApprovalKey::new("TEST-KEY")),
            notifier: self.notifier.clone(),
            clock: Arc::new(FixedClock::new(now)),
        }
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn finish(run: JoinHandle<krx_bot::AppResult<RunSummary>>) -> RunSummary {
    timeout(Duration::from_secs(5), run)
        .await
        .expect("application should stop")
        .expect("run task should not panic")
        .expect("run should succeed")
}

#[tokio::test]
async fn test_stored_session_exits_on_profit() {
    let server = MockWsServer::start().await;
    let f = Fixture::new();
    f.hold("005930", 10).await;

    let app = Application::new(config_for(&server), f.services(at(3, 10, 0))).unwrap();
    let run = tokio::spawn(app.run());

    assert!(eventually(|| async { server.is_subscribed("005930").await }).await);
    server.push(quote("005930", "10600"));
    let summary = finish(run).await;

    assert_eq!(summary.started, 1);
    assert_eq!(summary.count(MonitorOutcome::Exited), 1);
    assert_eq!(summary.crashed, 0);
    assert!(f.store.is_empty());
    let placement = &f.broker.placements()[0];
    assert_eq!(placement.side, OrderSide::Sell);
    assert_eq!(placement.price, Some(Price::from_krw(10_500)));
    assert!(eventually(|| async { !server.is_subscribed("005930").await }).await);
}

#[tokio::test]
async fn test_session_without_shares_not_monitored() {
    let server = MockWsServer::start().await;
    let f = Fixture::new();
    f.store.insert(session("005930", 0)).await.unwrap();

    let app = Application::new(config_for(&server), f.services(at(3, 10, 0))).unwrap();
    let summary = finish(tokio::spawn(app.run())).await;

    assert_eq!(summary.started, 0);
    assert!(summary.reports.is_empty());
    assert_eq!(f.store.len(), 1);
}

#[tokio::test]
async fn test_watchlist_entry_starts_monitor() {
    let server = MockWsServer::start().await;
    let f = Fixture::new();
    f.broker.set_cash(dec!(1_000_000));

    let mut config = config_for(&server);
    config.entry.max_slots = 1;
    config.watchlist = vec![WatchlistEntry {
        ticker: Ticker::from("005930"),
        name: "Samsung Electronics".to_string(),
        limit_price: Price::from_krw(71_200),
    }];

    let app = Application::new(config, f.services(at(3, 10, 0))).unwrap();
    let shutdown = app.shutdown_token();
    let run = tokio::spawn(app.run());

    assert!(eventually(|| async { server.is_subscribed("005930").await }).await);
    let sessions = f.store.list_all().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].quantity, 14);
    assert_eq!(f.broker.placements()[0].side, OrderSide::Buy);

    shutdown.cancel();
    let summary = finish(run).await;
    assert_eq!(summary.started, 1);
    assert_eq!(summary.count(MonitorOutcome::Cancelled), 1);
    assert_eq!(f.store.len(), 1);
}

#[tokio::test]
async fn test_watchlist_skipped_outside_trading_hours() {
    let server = MockWsServer::start().await;
    let f = Fixture::new();
    f.broker.set_cash(dec!(1_000_000));

    let mut config = config_for(&server);
    config.watchlist = vec![WatchlistEntry {
        ticker: Ticker::from("005930"),
        name: String::new(),
        limit_price: Price::from_krw(71_200),
    }];

    let app = Application::new(config, f.services(at(3, 8, 0))).unwrap();
    let summary = finish(tokio::spawn(app.run())).await;

    assert_eq!(summary.started, 0);
    assert!(f.broker.placements().is_empty());
    assert!(f.store.is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_every_monitor() {
    let server = MockWsServer::start().await;
    let f = Fixture::new();
    f.hold("005930", 10).await;
    f.hold("000660", 5).await;

    let app = Application::new(config_for(&server), f.services(at(3, 10, 0))).unwrap();
    let client = app.client();
    let shutdown = app.shutdown_token();
    let run = tokio::spawn(app.run());

    assert!(eventually(|| async {
        server.is_subscribed("005930").await && server.is_subscribed("000660").await
    })
    .await);

    shutdown.cancel();
    let summary = finish(run).await;

    assert_eq!(summary.started, 2);
    assert_eq!(summary.count(MonitorOutcome::Cancelled), 2);
    assert_eq!(f.store.len(), 2);
    assert!(f.broker.placements().is_empty());
    assert!(client.registry().is_empty());
    assert!(client.is_shutdown());
}
