//! Streaming approval key.
//!
//! The broker issues a short-lived approval key that every subscribe frame
//! carries. Fetching it is the broker-auth collaborator's job; the client
//! only caches whatever the provider returns and drops the cache when the
//! server rejects the key.

use crate::error::{WsError, WsResult};
use krx_core::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Source of streaming approval keys.
pub trait ApprovalKeyProvider: Send + Sync {
    /// Fetch a fresh key.
    fn approval_key(&self) -> BoxFuture<'_, WsResult<String>>;
}

/// Arc wrapper for ApprovalKeyProvider trait objects.
pub type DynApprovalKeyProvider = Arc<dyn ApprovalKeyProvider>;

/// Provider returning a fixed key (from config or environment).
#[derive(Debug, Clone)]
pub struct StaticApprovalKey(String);

impl StaticApprovalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl ApprovalKeyProvider for StaticApprovalKey {
    fn approval_key(&self) -> BoxFuture<'_, WsResult<String>> {
        Box::pin(async move {
            if self.0.is_empty() {
                return Err(WsError::Credential("approval key is empty".to_string()));
            }
            Ok(self.0.clone())
        })
    }
}

/// Cached approval key in front of a provider.
pub struct CredentialCache {
    provider: DynApprovalKeyProvider,
    cached: RwLock<Option<String>>,
}

impl CredentialCache {
    pub fn new(provider: DynApprovalKeyProvider) -> Self {
        Self {
            provider,
            cached: RwLock::new(None),
        }
    }

    /// Cached key, fetching it on first use.
    pub async fn get(&self) -> WsResult<String> {
        if let Some(key) = self.cached.read().clone() {
            return Ok(key);
        }
        let key = self.provider.approval_key().await?;
        *self.cached.write() = Some(key.clone());
        info!("Approval key acquired");
        Ok(key)
    }

    /// Cached key without fetching.
    pub fn current(&self) -> Option<String> {
        self.cached.read().clone()
    }

    /// Forget the cached key so the next `get` fetches a new one.
    pub fn invalidate(&self) {
        if self.cached.write().take().is_some() {
            debug!("Approval key invalidated");
        }
    }
}
