//! Mock quote server for integration tests.
//!
//! Provides a WebSocket server that can:
//! - Accept connections and count them
//! - Ack subscribe frames with `SUBSCRIBE SUCCESS`
//! - Record every received text frame, tagged with its connection number
//! - Push frames to all live connections, or drop them all

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone)]
enum Command {
    Send(String),
    DropAll,
}

/// A received text frame.
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: u32,
    pub text: String,
}

impl Received {
    /// `(tr_type, tr_key)` if this is a subscription frame.
    pub fn subscription(&self) -> Option<(String, String)> {
        let v: serde_json::Value = serde_json::from_str(&self.text).ok()?;
        let tr_type = v["header"]["tr_type"].as_str()?.to_string();
        let tr_key = v["body"]["input"]["tr_key"].as_str()?.to_string();
        Some((tr_type, tr_key))
    }
}

pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    commands: broadcast::Sender<Command>,
    messages: Arc<Mutex<Vec<Received>>>,
    connections: Arc<Mutex<u32>>,
}

impl MockWsServer {
    /// Start a new mock server on an available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages: Arc<Mutex<Vec<Received>>> = Arc::new(Mutex::new(Vec::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (commands, _) = broadcast::channel::<Command>(64);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let commands_clone = commands.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        let id = {
                            let mut count = connections_clone.lock().await;
                            *count += 1;
                            *count
                        };
                        tokio::spawn(handle_connection(
                            stream,
                            id,
                            messages_clone.clone(),
                            commands_clone.subscribe(),
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
            commands,
            messages,
            connections,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    pub async fn received(&self) -> Vec<Received> {
        self.messages.lock().await.clone()
    }

    /// Subscription frames received on connection `connection`.
    pub async fn subscriptions_on(&self, connection: u32) -> Vec<(String, String)> {
        self.received()
            .await
            .iter()
            .filter(|r| r.connection == connection)
            .filter_map(Received::subscription)
            .collect()
    }

    /// Push a text frame to every live connection.
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::Send(text.into()));
    }

    /// Close every live connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(Command::DropAll);
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    id: u32,
    messages: Arc<Mutex<Vec<Received>>>,
    mut commands: broadcast::Receiver<Command>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    messages.lock().await.push(Received {
                        connection: id,
                        text: text.clone(),
                    });
                    let received = Received { connection: id, text };
                    if let Some((tr_type, tr_key)) = received.subscription() {
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
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            cmd = commands.recv() => match cmd {
                Ok(Command::Send(text)) => {
                    let _ = write.send(Message::Text(text)).await;
                }
                Ok(Command::DropAll) | Err(_) => {
                    let _ = write.close().await;
                    break;
                }
            },
        }
    }
}

/// Poll `check` every 20ms until it returns true or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
