//! Streaming quote client for the KRX slot trader.
//!
//! Provides one long-lived WebSocket connection with:
//! - Automatic reconnection with exponential backoff
//! - Subscription snapshot and restoration across reconnects
//! - Keepalive echo and read-idle detection
//! - Per-ticker bounded quote queues with generation tracking
//! - Channel-based outbound writes (single socket owner)

pub mod connection;
pub mod credential;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod subscription;
pub mod ws_write_handle;

pub use connection::{
    backoff_delay, plan_resubscription, ConnectionConfig, ConnectionState, DynQuoteSubscriptions,
    QuoteSubscriptions, ResubscriptionPlan, StreamingClient,
};
pub use credential::{
    ApprovalKeyProvider, CredentialCache, DynApprovalKeyProvider, StaticApprovalKey,
};
pub use error::{WsError, WsResult};
pub use message::{
    best_ask, classify, is_control_frame, subscription_request, ControlFrame, InboundFrame,
    QuoteFrame, SubscriptionAction, ASK_FIELD_INDEX, DEFAULT_TR_ID, KEEPALIVE_MARKER,
};
pub use subscription::{Dispatch, SubscriptionHandle, SubscriptionRegistry};
pub use ws_write_handle::{WsOutbound, WsWriteHandle};
