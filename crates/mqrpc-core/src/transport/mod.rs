//! Broker abstraction.
//!
//! The RPC layer only needs a small slice of an AMQP-style broker: named
//! exchanges, queues bound to them by routing key, per-message correlation and
//! reply-to properties, and a consumer callback with explicit acknowledgement.
//! These traits describe that slice; [`memory::MemoryBroker`] implements it
//! in-process.

pub mod memory;

use crate::config::ProtocolConfig;
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

impl OutgoingMessage {
    /// A JSON message body.
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            body: body.into().into_bytes(),
            correlation_id: None,
            reply_to: None,
            content_type: Some(ProtocolConfig::CONTENT_TYPE.to_string()),
        }
    }

    pub fn with_correlation_id(mut self, token: impl Into<String>) -> Self {
        self.correlation_id = Some(token.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// Acknowledges a delivery back to the broker.
pub trait Acker: Send + Sync {
    fn ack(&self);
}

/// A message handed to a [`Consumer`].
#[derive(Clone)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub routing_key: String,
    acker: Option<Arc<dyn Acker>>,
}

impl Delivery {
    pub fn new(message: OutgoingMessage, routing_key: impl Into<String>) -> Self {
        Self {
            body: message.body,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            routing_key: routing_key.into(),
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// The body as UTF-8 text.
    pub fn body_str(&self) -> Result<&str> {
        Ok(std::str::from_utf8(&self.body)?)
    }

    /// Acknowledge the delivery. Never requeues.
    pub fn ack(&self) {
        if let Some(acker) = &self.acker {
            acker.ack();
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body", &String::from_utf8_lossy(&self.body))
            .field("correlation_id", &self.correlation_id)
            .field("reply_to", &self.reply_to)
            .field("routing_key", &self.routing_key)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing keys match binding patterns with `*` and `#` wildcards.
    Topic,
    /// Routing keys must equal the binding key.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSpec {
    Named { name: String, durable: bool },
    /// Broker-named, private to the declaring connection.
    Exclusive,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        QueueSpec::Named {
            name: name.into(),
            durable: true,
        }
    }
}

/// Entry point to a broker implementation.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn channel(&self) -> Result<Arc<dyn Channel>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        durable: bool,
        kind: ExchangeKind,
    ) -> Result<Arc<dyn Exchange>>;

    async fn declare_queue(&self, spec: QueueSpec) -> Result<Arc<dyn Queue>>;
}

#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Publish `message` under `routing_key`. Messages that match no binding
    /// are dropped.
    async fn publish(&self, message: OutgoingMessage, routing_key: &str) -> Result<()>;
}

#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    async fn bind(&self, exchange: &dyn Exchange, routing_key: &str) -> Result<()>;

    /// Start delivering messages to `consumer`, one at a time.
    async fn consume(&self, consumer: Arc<dyn Consumer>) -> Result<ConsumerHandle>;
}

/// Callback invoked for each delivery on a consumed queue.
///
/// The consumer owns acknowledgement. An `Err` is logged by the transport and
/// does not stop the consume loop.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn on_message(&self, delivery: &Delivery) -> Result<()>;
}

/// Running consume loop. Dropping the handle stops it.
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn new(queue: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            queue: queue.into(),
            task: Some(task),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub(crate) fn transport_error(message: impl Into<String>) -> RpcError {
    RpcError::Transport {
        message: message.into(),
    }
}
