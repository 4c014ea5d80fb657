//! Process-level wiring of dispatcher, registry and broker.
//!
//! An [`RpcNode`] owns one broker connection and one topic exchange named after
//! its service. As a listener it consumes one durable queue per routed method;
//! as a caller it consumes an exclusive reply queue and hands out
//! [`RemoteCall`]s that publish to the same exchange.

use crate::caller::RemoteCall;
use crate::config::Settings;
use crate::correlation::CorrelationRegistry;
use crate::dispatcher::{Dispatcher, Method};
use crate::error::{Result, RpcError};
use crate::listener::{RequestListener, ResponseListener};
use crate::transport::{
    Broker, Channel, Connection, ConsumerHandle, Exchange, ExchangeKind, QueueSpec,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

struct Link {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
    exchange: Arc<dyn Exchange>,
}

/// A service endpoint: registers methods, listens for calls and makes calls.
pub struct RpcNode {
    settings: Settings,
    broker: Arc<dyn Broker>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<CorrelationRegistry>,
    link: Mutex<Option<Link>>,
    reply_queue: RwLock<Option<String>>,
    consumers: Mutex<Vec<ConsumerHandle>>,
}

impl RpcNode {
    pub fn new(settings: Settings, broker: Arc<dyn Broker>) -> Self {
        Self {
            settings,
            broker,
            dispatcher: Arc::new(Dispatcher::new()),
            registry: Arc::new(CorrelationRegistry::new()),
            link: Mutex::new(None),
            reply_queue: RwLock::new(None),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Register `method` under `name`.
    ///
    /// Methods registered after [`start_listener`](Self::start_listener) are
    /// dispatched only if their routing key already reaches a consumed queue.
    pub async fn register(&self, name: impl Into<String>, method: Method) {
        self.dispatcher.register(name, method).await;
    }

    /// Open the connection, channel and service exchange. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }

        info!("Connection to {}", self.settings.broker_url);
        let connection = self.broker.connect(&self.settings.broker_url).await?;
        let channel = connection.channel().await?;
        let exchange = channel
            .declare_exchange(&self.settings.exchange, true, ExchangeKind::Topic)
            .await?;

        *link = Some(Link {
            connection,
            channel,
            exchange,
        });
        Ok(())
    }

    async fn handles(&self) -> Result<(Arc<dyn Channel>, Arc<dyn Exchange>)> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| (link.channel.clone(), link.exchange.clone()))
            .ok_or(RpcError::NotConnected)
    }

    /// Start consuming calls.
    ///
    /// Every registered method and every key in the settings' routes gets its
    /// queue (see [`Settings::queue_for`]); keys that share a queue share one
    /// consumer.
    pub async fn start_listener(&self) -> Result<()> {
        self.connect().await?;
        let (channel, exchange) = self.handles().await?;

        let mut queues: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut keys = self.dispatcher.method_names().await;
        keys.extend(self.settings.routes.keys().cloned());
        keys.sort();
        keys.dedup();
        for key in keys {
            queues
                .entry(self.settings.queue_for(&key))
                .or_default()
                .push(key);
        }

        if queues.is_empty() {
            warn!("Listener started with no methods registered");
        }

        let listener = Arc::new(RequestListener::new(
            self.dispatcher.clone(),
            exchange.clone(),
        ));
        let mut consumers = self.consumers.lock().await;
        for (queue_name, keys) in queues {
            let queue = channel.declare_queue(QueueSpec::durable(queue_name)).await?;
            for key in &keys {
                queue.bind(exchange.as_ref(), key).await?;
            }
            debug!("Consuming {} for {:?}", queue.name(), keys);
            consumers.push(queue.consume(listener.clone()).await?);
        }

        info!("Listener started");
        Ok(())
    }

    /// Declare the exclusive reply queue and start routing replies. Idempotent.
    pub async fn start_caller(&self) -> Result<()> {
        self.connect().await?;
        let mut reply_queue = self.reply_queue.write().await;
        if reply_queue.is_some() {
            return Ok(());
        }
        let (channel, exchange) = self.handles().await?;

        let queue = channel.declare_queue(QueueSpec::Exclusive).await?;
        queue.bind(exchange.as_ref(), queue.name()).await?;
        let handle = queue
            .consume(Arc::new(ResponseListener::new(self.registry.clone())))
            .await?;
        self.consumers.lock().await.push(handle);

        info!("Caller started on {}", queue.name());
        *reply_queue = Some(queue.name().to_string());
        Ok(())
    }

    /// Name of the reply queue, once the caller has started.
    pub async fn reply_queue(&self) -> Option<String> {
        self.reply_queue.read().await.clone()
    }

    /// A caller for the remote method `name`.
    ///
    /// Requires [`start_caller`](Self::start_caller).
    pub async fn caller(
        &self,
        name: impl Into<String>,
        ignore_result: bool,
    ) -> Result<RemoteCall> {
        let reply_to = self
            .reply_queue
            .read()
            .await
            .clone()
            .ok_or(RpcError::CallerNotStarted)?;
        let (_, exchange) = self.handles().await?;
        Ok(RemoteCall::new(
            name,
            ignore_result,
            self.registry.clone(),
            exchange,
            reply_to,
        ))
    }

    /// Stop all consumers and close the connection.
    ///
    /// Calls still waiting for a reply stay pending.
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = {
            let mut consumers = self.consumers.lock().await;
            let count = consumers.len();
            consumers.clear();
            count
        };
        *self.reply_queue.write().await = None;

        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.connection.close().await?;
            info!(
                "Disconnected from {} ({} consumers stopped)",
                self.settings.broker_url, stopped
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for RpcNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcNode")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Param;
    use crate::transport::memory::MemoryBroker;
    use serde_json::json;

    fn node(broker: &MemoryBroker, settings: Settings) -> RpcNode {
        RpcNode::new(settings, Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_caller_requires_start() {
        let broker = MemoryBroker::new();
        let node = node(&broker, Settings::new("svc"));
        assert!(matches!(
            node.caller("add", false).await,
            Err(RpcError::CallerNotStarted)
        ));
    }

    #[tokio::test]
    async fn test_listener_topology() {
        let broker = MemoryBroker::new();
        let node = node(
            &broker,
            Settings::new("svc").with_route("audit.*", "svc.audit"),
        );
        node.register("add", Method::sync(vec![Param::int("a")], |_| Ok(json!(0))))
            .await;
        node.register("sub", Method::sync(vec![], |_| Ok(json!(0))))
            .await;
        node.start_listener().await.unwrap();

        assert_eq!(
            broker.queue_names().await,
            vec!["svc.add", "svc.audit", "svc.sub"]
        );
        assert_eq!(broker.bindings("svc", "svc.add").await, vec!["add"]);
        assert_eq!(broker.bindings("svc", "svc.audit").await, vec!["audit.*"]);
    }

    #[tokio::test]
    async fn test_shared_queue_gets_one_consumer() {
        let broker = MemoryBroker::new();
        let node = node(
            &broker,
            Settings::new("svc")
                .with_route("add", "svc.math")
                .with_route("sub", "svc.math"),
        );
        node.register("add", Method::sync(vec![], |_| Ok(json!(0))))
            .await;
        node.register("sub", Method::sync(vec![], |_| Ok(json!(0))))
            .await;
        node.start_listener().await.unwrap();

        assert_eq!(broker.queue_names().await, vec!["svc.math"]);
        assert_eq!(broker.bindings("svc", "svc.math").await, vec!["add", "sub"]);
    }

    #[tokio::test]
    async fn test_start_caller_is_idempotent() {
        let broker = MemoryBroker::new();
        let node = node(&broker, Settings::new("svc"));
        node.start_caller().await.unwrap();
        let first = node.reply_queue().await.unwrap();
        node.start_caller().await.unwrap();
        assert_eq!(node.reply_queue().await.unwrap(), first);
        assert!(first.starts_with("amq.gen-"));
        assert_eq!(broker.bindings("svc", &first).await, vec![first.clone()]);

        node.shutdown().await.unwrap();
        assert!(node.reply_queue().await.is_none());
        assert!(broker.queue_names().await.is_empty());
    }
}
