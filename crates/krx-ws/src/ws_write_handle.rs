//! Write handle for the streaming connection.
//!
//! The connection loop is the only task touching the socket. Everyone else
//! queues frames through this handle; the loop drains the queue between
//! reads. Subscription frames carry their ticker so the loop can check
//! desired membership at send time and drop frames a later call superseded.

use crate::connection::ConnectionState;
use crate::error::{WsError, WsResult};
use crate::message::SubscriptionAction;
use krx_core::Ticker;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOutbound {
    /// Raw text, sent as-is.
    Text(String),
    /// Subscribe/unsubscribe intent for a ticker. The envelope is built
    /// by the loop with the current approval key.
    Subscription {
        ticker: Ticker,
        action: SubscriptionAction,
    },
}

/// Cloneable handle for queueing outbound frames.
#[derive(Clone)]
pub struct WsWriteHandle {
    tx: mpsc::Sender<WsOutbound>,
    state: Arc<RwLock<ConnectionState>>,
}

impl WsWriteHandle {
    pub fn new(tx: mpsc::Sender<WsOutbound>, state: Arc<RwLock<ConnectionState>>) -> Self {
        Self { tx, state }
    }

    /// Queue a subscription intent.
    ///
    /// # Errors
    ///
    /// `WsError::ChannelClosed` once the client has stopped.
    pub async fn send_subscription(
        &self,
        ticker: Ticker,
        action: SubscriptionAction,
    ) -> WsResult<()> {
        debug!(%ticker, ?action, "Queueing subscription frame");
        self.tx
            .send(WsOutbound::Subscription { ticker, action })
            .await
            .map_err(|_| WsError::ChannelClosed)
    }

    /// Queue raw text.
    pub async fn send_text(&self, text: String) -> WsResult<()> {
        self.tx
            .send(WsOutbound::Text(text))
            .await
            .map_err(|_| WsError::ChannelClosed)
    }

    /// Connection state is Connected and the channel is open.
    pub fn is_connected(&self) -> bool {
        *self.state.read() == ConnectionState::Connected && !self.tx.is_closed()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
