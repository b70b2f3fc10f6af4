//! Streaming client integration tests against an in-process quote server.
//!
//! Covers:
//! - Deferred subscription sent on first connect
//! - Keepalive echo
//! - Quote routing and ack consumption
//! - Repeated subscribe sends one frame
//! - Snapshot resubscription after a server-side drop
//! - Graceful shutdown

mod common;
use common::mock_ws::{eventually, MockWsServer};

use krx_core::Ticker;
use krx_ws::{
    ConnectionConfig, ConnectionState, QuoteSubscriptions, StaticApprovalKey, StreamingClient,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn quote(ticker: &str, ask: &str) -> String {
    let mut fields = vec![format!("0|H0STCNT0|001|{ticker}")];
    for i in 1..20 {
        fields.push(if i == 15 { ask.to_string() } else { i.to_string() });
    }
    fields.join("^")
}

fn client_for(server: &MockWsServer) -> Arc<StreamingClient> {
    let config = ConnectionConfig {
        url: server.url(),
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 50,
        connect_timeout_ms: 2_000,
        ..Default::default()
    };
    Arc::new(StreamingClient::new(
        config,
        Arc::new(StaticApprovalKey::new("TEST-KEY")),
    ))
}

fn spawn_run(client: &Arc<StreamingClient>) -> tokio::task::JoinHandle<krx_ws::WsResult<()>> {
    let c = client.clone();
    tokio::spawn(async move { c.run().await })
}

async fn wait_connected(client: &StreamingClient) {
    let ok = eventually(Duration::from_secs(3), || async {
        client.state() == ConnectionState::Connected
    })
    .await;
    assert!(ok, "client should connect");
}

#[tokio::test]
async fn test_deferred_subscription_sent_on_connect() {
    let server = MockWsServer::start().await;
    let client = client_for(&server);

    let t = Ticker::from("005930");
    let _handle = client.register(t.clone());
    client.subscribe(&t).await.unwrap();

    let task = spawn_run(&client);
    wait_connected(&client).await;

    let ok = eventually(Duration::from_secs(2), || async {
        server.subscriptions_on(1).await == vec![("1".to_string(), "005930".to_string())]
    })
    .await;
    assert!(ok, "subscribe frame should reach the server");

    let first = &server.received().await[0];
    assert!(first.text.contains("\"approval_key\":\"TEST-KEY\""));

    client.shutdown();
    let _ = timeout(Duration::from_secs(2), task).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_keepalive_echoed_verbatim() {
    let server = MockWsServer::start().await;
    let client = client_for(&server);
    let task = spawn_run(&client);
    wait_connected(&client).await;

    let ping = r#"{"header":{"tr_id":"PINGPONG","datetime":"20260302093001"}}"#;
    server.push(ping);

    let ok = eventually(Duration::from_secs(2), || async {
        server.received().await.iter().any(|r| r.text == ping)
    })
    .await;
    assert!(ok, "keepalive should be echoed unmodified");

    client.shutdown();
    let _ = timeout(Duration::from_secs(2), task).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_quotes_routed_only_to_subscribed_tickers() {
    let server = MockWsServer::start().await;
    let client = client_for(&server);
    let task = spawn_run(&client);
    wait_connected(&client).await;

    let samsung = Ticker::from("005930");
    let hynix = Ticker::from("000660");
    let mut samsung_q = client.register(samsung.clone());
    let mut hynix_q = client.register(hynix.clone());
    client.subscribe(&samsung).await.unwrap();

    // Wait for the ack round trip so the subscription is live.
    assert!(
        eventually(Duration::from_secs(2), || async {
            !server.subscriptions_on(1).await.is_empty()
        })
        .await
    );

    server.push(quote("000660", "120000"));
    server.push(quote("005930", "71200"));
    server.push(quote("005930", "71300"));

    let first = timeout(Duration::from_secs(2), samsung_q.rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(2), samsung_q.rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, quote("005930", "71200"));
    assert_eq!(second, quote("005930", "71300"));
    assert!(hynix_q.rx.try_recv().is_err(), "unsubscribed ticker gets nothing");

    client.shutdown();
    let _ = timeout(Duration::from_secs(2), task).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_repeated_subscribe_sends_one_frame() {
    let server = MockWsServer::start().await;
    let client = client_for(&server);
    let task = spawn_run(&client);
    wait_connected(&client).await;

    let samsung = Ticker::from("005930");
    let hynix = Ticker::from("000660");
    let _samsung_q = client.register(samsung.clone());
    let _hynix_q = client.register(hynix.clone());
    client.subscribe(&samsung).await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), || async {
            server.subscriptions_on(1).await.len() == 1
        })
        .await
    );

    client.subscribe(&samsung).await.unwrap();
    client.subscribe(&samsung).await.unwrap();
    // Queued after the repeats, so its arrival means they were handled.
    client.subscribe(&hynix).await.unwrap();
    assert!(
        eventually(Duration::from_secs(2), || async {
            server
                .subscriptions_on(1)
                .await
                .iter()
                .any(|(_, key)| key == "000660")
        })
        .await
    );

    let samsung_frames = server
        .subscriptions_on(1)
        .await
        .into_iter()
        .filter(|(_, key)| key == "005930")
        .count();
    assert_eq!(samsung_frames, 1);

    client.shutdown();
    let _ = timeout(Duration::from_secs(2), task).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_resubscribes_snapshot_after_drop() {
    let server = MockWsServer::start().await;
    let client = client_for(&server);
    let task = spawn_run(&client);
    wait_connected(&client).await;

    let mut handles = Vec::new();
    for code in ["035720", "005930", "000660"] {
        let t = Ticker::from(code);
        handles.push(client.register(t.clone()));
        client.subscribe(&t).await.unwrap();
    }
    assert!(
        eventually(Duration::from_secs(2), || async {
            server.subscriptions_on(1).await.len() == 3
        })
        .await
    );

    server.drop_connections();

    let ok = eventually(Duration::from_secs(3), || async {
        server.subscriptions_on(2).await.len() == 3
    })
    .await;
    assert!(ok, "all snapshot members resubscribed on the new connection");

    let mut keys: Vec<_> = server
        .subscriptions_on(2)
        .await
        .into_iter()
        .map(|(tr_type, key)| {
            assert_eq!(tr_type, "1");
            key
        })
        .collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys, vec!["000660", "005930", "035720"]);

    client.shutdown();
    let _ = timeout(Duration::from_secs(2), task).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_run() {
    let server = MockWsServer::start().await;
    let client = client_for(&server);
    let task = spawn_run(&client);
    wait_connected(&client).await;

    client.shutdown();
    let result = timeout(Duration::from_secs(2), task)
        .await
        .expect("run should exit promptly")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    server.shutdown().await;
}
