//! Pending-call registry keyed by correlation token.
//!
//! The remote caller inserts a [`PendingCall`] before publishing a request; the
//! response listener resolves it when the reply arrives. Each entry is removed
//! exactly once, either by [`CorrelationRegistry::resolve`] or by
//! [`CorrelationRegistry::cancel`].
//!
//! There is no expiry: a call that never receives a reply stays registered
//! until it is cancelled (see [`RemoteCall::with_timeout`](crate::RemoteCall::with_timeout)).

use crate::error::{Result, RpcError};
use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Generate a fresh correlation token.
pub fn new_token() -> String {
    Uuid::new_v4().to_string()
}

/// Receiving side of a pending call.
#[derive(Debug)]
pub struct PendingCall {
    token: String,
    rx: oneshot::Receiver<String>,
}

impl PendingCall {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wait for the raw reply payload.
    pub async fn wait(self) -> Result<String> {
        let token = self.token;
        self.rx.await.map_err(|_| RpcError::CallDropped { token })
    }
}

/// Map from correlation token to the sender half of a pending call.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending call under `token`.
    ///
    /// Must happen before the request is published, otherwise a fast reply can
    /// arrive for a token that is not registered yet.
    pub async fn insert(&self, token: impl Into<String>) -> PendingCall {
        let token = token.into();
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock().await;
        if pending.insert(token.clone(), tx).is_some() {
            warn!("Correlation token {} reused; previous caller dropped", token);
        }
        debug!(
            "Registered pending call {} ({} pending)",
            token,
            pending.len()
        );

        PendingCall { token, rx }
    }

    /// Remove the entry for `token` and hand it `payload`.
    ///
    /// Fails with [`RpcError::UnknownCorrelation`] when no call is pending
    /// under `token` (a late, duplicated or foreign reply).
    pub async fn resolve(&self, token: &str, payload: String) -> Result<()> {
        let tx = self
            .pending
            .lock()
            .await
            .remove(token)
            .ok_or_else(|| RpcError::UnknownCorrelation {
                token: token.to_string(),
            })?;

        if tx.send(payload).is_err() {
            debug!("Caller for {} went away before its reply arrived", token);
        }
        Ok(())
    }

    /// Drop the pending entry for `token`, if any.
    pub async fn cancel(&self, token: &str) -> bool {
        self.pending.lock().await.remove(token).is_some()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Tokens of all pending calls, sorted (for diagnostics).
    pub async fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.pending.lock().await.keys().cloned().collect();
        tokens.sort();
        tokens
    }
}
