//! Remote method invocation.
//!
//! A [`RemoteCall`] is bound to one method name. Each invocation publishes a
//! request on the service exchange with the method name as routing key, a fresh
//! correlation token and the caller's reply queue. When a result is expected it
//! then waits for the matching reply, delivered through the
//! [`CorrelationRegistry`] by the response listener.

use crate::config::ProtocolConfig;
use crate::correlation::{new_token, CorrelationRegistry};
use crate::envelope::{Params, Reply, Request};
use crate::error::{Result, RpcError};
use crate::transport::{Exchange, OutgoingMessage};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Client handle for one remote method.
pub struct RemoteCall {
    method: String,
    ignore_result: bool,
    next_id: AtomicI64,
    registry: Arc<CorrelationRegistry>,
    exchange: Arc<dyn Exchange>,
    reply_to: String,
    timeout: Option<Duration>,
}

impl RemoteCall {
    pub fn new(
        method: impl Into<String>,
        ignore_result: bool,
        registry: Arc<CorrelationRegistry>,
        exchange: Arc<dyn Exchange>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            ignore_result,
            next_id: AtomicI64::new(ProtocolConfig::FIRST_CALL_ID),
            registry,
            exchange,
            reply_to: reply_to.into(),
            timeout: None,
        }
    }

    /// Give up waiting for a reply after `timeout`. Without one, a call whose
    /// reply never arrives waits forever.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn ignores_result(&self) -> bool {
        self.ignore_result
    }

    /// Request id the next awaited call will carry.
    pub fn next_id(&self) -> i64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Invoke the remote method.
    ///
    /// Returns `Ok(None)` right after publishing when the call ignores its
    /// result. Otherwise waits for the reply and returns its result, or the
    /// remote error re-raised as the matching local error.
    pub async fn call(&self, params: impl Into<Params>) -> Result<Option<Value>> {
        let params = params.into();
        let token = new_token();

        let request = if self.ignore_result {
            Request::notification(self.method.as_str(), params)
        } else {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Request::new(self.method.as_str(), params, id)
        };

        let message = OutgoingMessage::json(request.encode()?)
            .with_correlation_id(token.as_str())
            .with_reply_to(self.reply_to.as_str());

        if self.ignore_result {
            debug!("Notifying {} ({})", self.method, token);
            self.exchange.publish(message, &self.method).await?;
            return Ok(None);
        }

        // Registered before publishing so a fast reply always finds its waiter.
        let pending = self.registry.insert(token.as_str()).await;
        debug!("Calling {} ({})", self.method, token);

        if let Err(e) = self.exchange.publish(message, &self.method).await {
            self.registry.cancel(&token).await;
            return Err(e);
        }

        let payload = match self.timeout {
            None => pending.wait().await?,
            Some(timeout) => match tokio::time::timeout(timeout, pending.wait()).await {
                Ok(payload) => payload?,
                Err(_) => {
                    self.registry.cancel(&token).await;
                    warn!("Call to {} ({}) timed out", self.method, token);
                    return Err(RpcError::Timeout {
                        method: self.method.clone(),
                        timeout,
                    });
                }
            },
        };

        Reply::decode(&payload)?.into_result().map(Some)
    }

    /// Invoke the remote method and deserialize its result into `T`.
    ///
    /// A call that ignores its result deserializes from `null`.
    pub async fn call_as<T: DeserializeOwned>(&self, params: impl Into<Params>) -> Result<T> {
        let value = self.call(params).await?.unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)?)
    }
}

impl std::fmt::Debug for RemoteCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCall")
            .field("method", &self.method)
            .field("ignore_result", &self.ignore_result)
            .field("exchange", &self.exchange.name())
            .field("reply_to", &self.reply_to)
            .field("timeout", &self.timeout)
            .finish()
    }
}
