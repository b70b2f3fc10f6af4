//! Streaming client connection manager.
//!
//! Owns the single quote socket: connection lifecycle, automatic
//! reconnection with exponential backoff, keepalive echo, routing of quote
//! frames into per-ticker queues and restoration of subscriptions after a
//! reconnect.

use crate::credential::{CredentialCache, DynApprovalKeyProvider};
use crate::error::{WsError, WsResult};
use crate::heartbeat::HeartbeatMonitor;
use crate::message::{
    classify, subscription_request, InboundFrame, SubscriptionAction, DEFAULT_TR_ID,
};
use crate::subscription::{
    Dispatch, SubscriptionHandle, SubscriptionRegistry, DEFAULT_QUEUE_CAPACITY,
};
use crate::ws_write_handle::{WsOutbound, WsWriteHandle};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use krx_core::{BoxFuture, Ticker};
use krx_telemetry::Metrics;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    pub url: String,
    /// Realtime transaction id put in every subscribe frame.
    pub tr_id: String,
    /// Socket open + handshake timeout.
    pub connect_timeout_ms: u64,
    /// A socket silent for this long is treated as dead.
    pub idle_timeout_ms: u64,
    /// Maximum consecutive reconnection attempts (0 = infinite).
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Per-ticker quote queue depth.
    pub queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            tr_id: DEFAULT_TR_ID.to_string(),
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 60_000,
            max_reconnect_attempts: 0, // Infinite
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Subscription frames to send right after a reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResubscriptionPlan {
    /// Everything that was on the wire when the socket dropped.
    pub resubscribe: Vec<Ticker>,
    /// Subscribed while disconnected.
    pub subscribe_added: Vec<Ticker>,
    /// In the snapshot but unsubscribed while disconnected.
    pub unsubscribe_removed: Vec<Ticker>,
}

/// Work out the post-reconnect frames from the disconnect snapshot and the
/// current desired membership. Sorted, no duplicates.
pub fn plan_resubscription(
    snapshot: &BTreeSet<Ticker>,
    desired: &BTreeSet<Ticker>,
) -> ResubscriptionPlan {
    ResubscriptionPlan {
        resubscribe: snapshot.iter().cloned().collect(),
        subscribe_added: desired.difference(snapshot).cloned().collect(),
        unsubscribe_removed: snapshot.difference(desired).cloned().collect(),
    }
}

/// Subscription control used by position monitors.
pub trait QuoteSubscriptions: Send + Sync {
    /// Create (or replace) the quote queue for `ticker`.
    fn register(&self, ticker: Ticker) -> SubscriptionHandle;

    /// Mark `ticker` subscribed and send the frame (deferred while
    /// disconnected).
    fn subscribe<'a>(&'a self, ticker: &'a Ticker) -> BoxFuture<'a, WsResult<()>>;

    /// Mark `ticker` unsubscribed and send the frame. Membership is updated
    /// even when the send fails.
    fn unsubscribe<'a>(&'a self, ticker: &'a Ticker) -> BoxFuture<'a, WsResult<()>>;

    /// Drop the queue if `generation` still owns it. Returns whether it did.
    fn release(&self, ticker: &Ticker, generation: u64) -> bool;

    /// Whether `generation` still owns the queue for `ticker`.
    fn is_current(&self, ticker: &Ticker, generation: u64) -> bool;

    /// Whether `ticker` is in the desired wire membership.
    fn is_subscribed(&self, ticker: &Ticker) -> bool;
}

/// Arc wrapper for QuoteSubscriptions trait objects.
pub type DynQuoteSubscriptions = Arc<dyn QuoteSubscriptions>;

/// The streaming quote client.
pub struct StreamingClient {
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    last_error: RwLock<Option<String>>,
    registry: Arc<SubscriptionRegistry>,
    credential: CredentialCache,
    heartbeat: HeartbeatMonitor,
    /// Tickers subscribed on the current socket.
    wire: Mutex<BTreeSet<Ticker>>,
    /// Wire membership at the last disconnect, not yet restored.
    snapshot: Mutex<BTreeSet<Ticker>>,
    reconnect_count: AtomicU32,
    /// Outbound message sender (for WsWriteHandle).
    outbound_tx: mpsc::Sender<WsOutbound>,
    /// Outbound message receiver (consumed by message loop).
    outbound_rx: TokioMutex<mpsc::Receiver<WsOutbound>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
}

impl StreamingClient {
    /// Create a new client. Nothing connects until `run`.
    pub fn new(config: ConnectionConfig, approval_keys: DynApprovalKeyProvider) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        Self {
            registry: Arc::new(SubscriptionRegistry::new(config.queue_capacity)),
            heartbeat: HeartbeatMonitor::new(Duration::from_millis(config.idle_timeout_ms)),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            last_error: RwLock::new(None),
            credential: CredentialCache::new(approval_keys),
            wire: Mutex::new(BTreeSet::new()),
            snapshot: Mutex::new(BTreeSet::new()),
            reconnect_count: AtomicU32::new(0),
            outbound_tx,
            outbound_rx: TokioMutex::new(outbound_rx),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a write handle for queueing frames.
    pub fn write_handle(&self) -> WsWriteHandle {
        WsWriteHandle::new(self.outbound_tx.clone(), self.state.clone())
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Most recent connection error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Tickers subscribed on the current socket.
    pub fn wire_tickers(&self) -> BTreeSet<Ticker> {
        self.wire.lock().clone()
    }

    /// Signal graceful shutdown.
    ///
    /// Cancels the shutdown token, which makes both the message loop and
    /// the reconnect loop exit promptly.
    pub fn shutdown(&self) {
        info!("StreamingClient shutdown requested");
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        Metrics::ws_state_set(state.as_str());
        match state {
            ConnectionState::Connected => Metrics::ws_connected(),
            _ => Metrics::ws_disconnected(),
        }
    }

    /// Subscribe `ticker`. Deferred (membership only) while disconnected.
    pub async fn subscribe(&self, ticker: &Ticker) -> WsResult<()> {
        self.registry.set_subscribed(ticker.as_str(), true)?;
        if !self.is_connected() {
            debug!(%ticker, "Disconnected, subscription deferred to reconnect");
            return Ok(());
        }
        self.write_handle()
            .send_subscription(ticker.clone(), SubscriptionAction::Subscribe)
            .await
    }

    /// Unsubscribe `ticker`. Membership is cleared first, so a failed send
    /// still leaves the ticker out of every later resubscription.
    pub async fn unsubscribe(&self, ticker: &Ticker) -> WsResult<()> {
        match self.registry.set_subscribed(ticker.as_str(), false) {
            Ok(_) | Err(WsError::NotRegistered(_)) => {}
            Err(e) => return Err(e),
        }
        if !self.is_connected() {
            debug!(%ticker, "Disconnected, unsubscribe recorded locally");
            return Ok(());
        }
        self.write_handle()
            .send_subscription(ticker.clone(), SubscriptionAction::Unsubscribe)
            .await
    }

    /// Release the queue for `ticker` if `generation` still owns it, and
    /// take the ticker off the wire.
    pub fn release(&self, ticker: &Ticker, generation: u64) -> bool {
        match self.registry.release(ticker.as_str(), generation) {
            Some(was_subscribed) => {
                if was_subscribed && self.is_connected() {
                    let frame = WsOutbound::Subscription {
                        ticker: ticker.clone(),
                        action: SubscriptionAction::Unsubscribe,
                    };
                    if self.outbound_tx.try_send(frame).is_err() {
                        warn!(%ticker, "Could not queue unsubscribe on release");
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Connect and run until shutdown or until reconnect attempts are
    /// exhausted.
    pub async fn run(&self) -> WsResult<()> {
        self.connect_with_retry().await
    }

    async fn connect_with_retry(&self) -> WsResult<()> {
        loop {
            if self.is_shutdown() {
                info!("Shutdown requested, exiting connect loop");
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            self.set_state(ConnectionState::Connecting);

            match self.try_connect().await {
                Ok(()) => {
                    info!("WebSocket connection closed");
                }
                Err(e) => {
                    error!(?e, "WebSocket connection error");
                    if e.is_auth_failure() {
                        self.credential.invalidate();
                    }
                    Metrics::ws_reconnect(reason_label(&e));
                    *self.last_error.write() = Some(e.to_string());
                }
            }
            self.on_disconnect();

            if self.is_shutdown() {
                info!("Shutdown requested after disconnect, not reconnecting");
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            let attempt = self.reconnect_count.fetch_add(1, Ordering::SeqCst) + 1;
            if self.config.max_reconnect_attempts > 0
                && attempt >= self.config.max_reconnect_attempts
            {
                error!(attempt, "Max reconnection attempts reached");
                return Err(WsError::ConnectionFailed(
                    "Max reconnection attempts reached".to_string(),
                ));
            }

            let delay = self.calculate_backoff_delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis(), "Reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown requested during backoff, exiting");
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
            }
        }
    }

    /// Snapshot the wire set for the next reconnect and mark disconnected.
    fn on_disconnect(&self) {
        let on_wire = std::mem::take(&mut *self.wire.lock());
        let mut snapshot = self.snapshot.lock();
        snapshot.extend(on_wire);
        Metrics::subscribed_set(0);
        self.set_state(ConnectionState::Disconnected);
        debug!(snapshot = snapshot.len(), "Saved subscription snapshot");
    }

    async fn try_connect(&self) -> WsResult<()> {
        let approval_key = self.credential.get().await?;

        info!(url = %self.config.url, "Connecting to WebSocket");
        let connect = connect_async_tls_with_config(&self.config.url, None, true, None);
        let (ws_stream, _response) =
            tokio::time::timeout(Duration::from_millis(self.config.connect_timeout_ms), connect)
                .await
                .map_err(|_| WsError::ConnectTimeout(self.config.connect_timeout_ms))??;
        let (mut write, mut read) = ws_stream.split();

        self.set_state(ConnectionState::Connected);
        self.reconnect_count.store(0, Ordering::SeqCst);
        *self.last_error.write() = None;
        self.heartbeat.reset();
        info!("WebSocket connected");

        self.restore_subscriptions(&mut write, &approval_key).await;

        loop {
            let outbound_recv = async { self.outbound_rx.lock().await.recv().await };

            tokio::select! {
                () = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received in message loop");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(?e, "Failed to send Close frame during shutdown");
                    }
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.heartbeat.record_message();
                            self.handle_text_message(&mut write, text).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.heartbeat.record_message();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "WebSocket closed by server");
                            return Err(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => {
                            error!(?e, "WebSocket read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            return Ok(());
                        }
                        _ => {
                            self.heartbeat.record_message();
                        }
                    }
                }

                outbound = outbound_recv => {
                    if let Some(msg) = outbound {
                        self.send_outbound(&mut write, &approval_key, msg).await?;
                    }
                }

                () = self.heartbeat.wait_for_check() => {
                    if self.heartbeat.is_timed_out() {
                        let idle_ms = self.config.idle_timeout_ms;
                        error!(idle_ms, "No frames within idle timeout");
                        return Err(WsError::IdleTimeout(idle_ms));
                    }
                }
            }
        }
    }

    async fn handle_text_message(&self, write: &mut WsSink, text: String) -> WsResult<()> {
        let frame = classify(&text);
        Metrics::ws_frame(frame.kind());

        match frame {
            InboundFrame::Keepalive => {
                debug!("Keepalive received, echoing");
                write.send(Message::Text(text.clone())).await?;
            }
            InboundFrame::Control(control) => {
                let tr_key = control.header.tr_key.as_deref().unwrap_or("-");
                if control.is_auth_failure() {
                    error!(tr_key, msg = control.message(), "Approval key rejected");
                    return Err(WsError::Credential(control.message().to_string()));
                }
                if control.is_success() {
                    debug!(tr_key, msg = control.message(), "Subscription ack");
                } else {
                    warn!(tr_key, msg = control.message(), "Subscription request refused");
                }
            }
            InboundFrame::Quote(quote) => match self.registry.dispatch(quote.ticker, quote.raw) {
                Dispatch::Delivered | Dispatch::QueueFull => {}
                Dispatch::NotSubscribed | Dispatch::Closed => {
                    Metrics::ws_frame("unrouted");
                    debug!(ticker = quote.ticker, "Quote for untracked ticker");
                }
            },
            InboundFrame::Unknown => {
                debug!(len = text.len(), "Ignoring unrecognized frame");
            }
        }
        Ok(())
    }

    /// Send one queued frame. Subscription intents are checked against
    /// desired membership and the wire set at send time; a superseded or
    /// already-applied intent is dropped.
    async fn send_outbound(
        &self,
        write: &mut WsSink,
        approval_key: &str,
        msg: WsOutbound,
    ) -> WsResult<()> {
        match msg {
            WsOutbound::Text(text) => {
                write.send(Message::Text(text)).await?;
            }
            WsOutbound::Subscription { ticker, action } => {
                let desired = self.registry.is_subscribed(ticker.as_str());
                let on_wire = self.wire.lock().contains(&ticker);
                let needed = match action {
                    SubscriptionAction::Subscribe => desired && !on_wire,
                    SubscriptionAction::Unsubscribe => !desired && on_wire,
                };
                if !needed {
                    debug!(%ticker, ?action, "Dropping superseded subscription frame");
                    return Ok(());
                }
                self.send_subscription_frame(write, approval_key, &ticker, action)
                    .await?;
            }
        }
        Ok(())
    }

    async fn send_subscription_frame(
        &self,
        write: &mut WsSink,
        approval_key: &str,
        ticker: &Ticker,
        action: SubscriptionAction,
    ) -> WsResult<()> {
        let text = subscription_request(approval_key, &self.config.tr_id, ticker.as_str(), action)?;
        write.send(Message::Text(text)).await?;

        let mut wire = self.wire.lock();
        match action {
            SubscriptionAction::Subscribe => wire.insert(ticker.clone()),
            SubscriptionAction::Unsubscribe => wire.remove(ticker),
        };
        Metrics::subscribed_set(wire.len());
        debug!(%ticker, ?action, "Subscription frame sent");
        Ok(())
    }

    /// Replay the disconnect snapshot, then reconcile against membership
    /// changes made while disconnected. Per-ticker failures are logged and
    /// skipped.
    async fn restore_subscriptions(&self, write: &mut WsSink, approval_key: &str) {
        // Intents queued before the drop are superseded by the plan.
        let mut leftover_text = Vec::new();
        {
            let mut rx = self.outbound_rx.lock().await;
            while let Ok(msg) = rx.try_recv() {
                if let WsOutbound::Text(text) = msg {
                    leftover_text.push(text);
                }
            }
        }

        let snapshot = self.snapshot.lock().clone();
        let desired = self.registry.subscribed_tickers();
        let plan = plan_resubscription(&snapshot, &desired);
        info!(
            resubscribe = plan.resubscribe.len(),
            added = plan.subscribe_added.len(),
            removed = plan.unsubscribe_removed.len(),
            "Restoring subscriptions"
        );

        let steps = plan
            .resubscribe
            .iter()
            .chain(plan.subscribe_added.iter())
            .map(|t| (t, SubscriptionAction::Subscribe))
            .chain(
                plan.unsubscribe_removed
                    .iter()
                    .map(|t| (t, SubscriptionAction::Unsubscribe)),
            );

        for (ticker, action) in steps {
            if let Err(e) = self
                .send_subscription_frame(write, approval_key, ticker, action)
                .await
            {
                warn!(%ticker, ?action, ?e, "Resubscription step failed, skipping");
            }
        }
        self.snapshot.lock().clear();

        for text in leftover_text {
            if let Err(e) = write.send(Message::Text(text)).await {
                warn!(?e, "Failed to flush queued text frame");
            }
        }
    }

    fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
            attempt,
        )
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`, plus up
/// to `min(base, 1000)` ms of jitter.
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let delay = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    let jitter = rand_jitter(base_ms.min(1000));
    Duration::from_millis(delay + jitter)
}

/// Random jitter in `0..bound` ms.
fn rand_jitter(bound: u64) -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    if bound == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    u64::from(nanos) % bound
}

fn reason_label(e: &WsError) -> &'static str {
    match e {
        WsError::ConnectTimeout(_) => "connect_timeout",
        WsError::ConnectionClosed { .. } => "closed",
        WsError::IdleTimeout(_) => "idle",
        WsError::Credential(_) => "credential",
        _ => "error",
    }
}

impl QuoteSubscriptions for StreamingClient {
    fn register(&self, ticker: Ticker) -> SubscriptionHandle {
        self.registry.register(ticker)
    }

    fn subscribe<'a>(&'a self, ticker: &'a Ticker) -> BoxFuture<'a, WsResult<()>> {
        Box::pin(StreamingClient::subscribe(self, ticker))
    }

    fn unsubscribe<'a>(&'a self, ticker: &'a Ticker) -> BoxFuture<'a, WsResult<()>> {
        Box::pin(StreamingClient::unsubscribe(self, ticker))
    }

    fn release(&self, ticker: &Ticker, generation: u64) -> bool {
        StreamingClient::release(self, ticker, generation)
    }

    fn is_current(&self, ticker: &Ticker, generation: u64) -> bool {
        self.registry.is_current(ticker.as_str(), generation)
    }

    fn is_subscribed(&self, ticker: &Ticker) -> bool {
        self.registry.is_subscribed(ticker.as_str())
    }
}
