//! Mock quote server for integration tests.
//!
//! Provides a simple WebSocket server that can:
//! - Accept connections
//! - Ack subscription frames
//! - Record `(tr_type, tr_key)` of every subscription frame
//! - Push quote frames to all live connections

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// A mock quote server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    outbound: broadcast::Sender<String>,
    subscriptions: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockWsServer {
    /// Start a new mock server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (outbound, _) = broadcast::channel::<String>(64);

        let subscriptions_clone = subscriptions.clone();
        let outbound_clone = outbound.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            subscriptions_clone.clone(),
                            outbound_clone.subscribe(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            outbound,
            subscriptions,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Every subscription frame received, in order.
    pub async fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions.lock().await.clone()
    }

    /// Whether the last frame for `ticker` was a subscribe.
    pub async fn is_subscribed(&self, ticker: &str) -> bool {
        self.subscriptions()
            .await
            .iter()
            .rev()
            .find(|(_, key)| key == ticker)
            .is_some_and(|(tr_type, _)| tr_type == "1")
    }

    /// Push a text frame to every live connection.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.outbound.send(text.into());
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    subscriptions: Arc<Mutex<Vec<(String, String)>>>,
    mut outbound: broadcast::Receiver<String>,
) {
    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    let (Some(tr_type), Some(tr_key)) = (
                        v["header"]["tr_type"].as_str(),
                        v["body"]["input"]["tr_key"].as_str(),
                    ) else {
                        continue;
                    };
                    subscriptions
                        .lock()
                        .await
                        .push((tr_type.to_string(), tr_key.to_string()));
                    let msg1 = if tr_type == "1" {
                        "SUBSCRIBE SUCCESS"
                    } else {
                        "UNSUBSCRIBE SUCCESS"
                    };
                    let ack = serde_json::json!({
                        "header": {"tr_id": "H0STCNT0", "tr_key": tr_key, "encrypt": "N"},
                        "body": {"rt_cd": "0", "msg_cd": "OPSP0000", "msg1": msg1}
                    });
                    let _ = write.send(Message::Text(ack.to_string())).await;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            frame = outbound.recv() => match frame {
                Ok(text) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
