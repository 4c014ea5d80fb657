//! In-process broker.
//!
//! Implements the subset of AMQP topic routing the RPC layer relies on:
//! durable and exclusive queues, topic and direct exchanges, per-queue FIFO
//! delivery shared by competing consumers, and acknowledgement counting.
//! Messages published while no consumer is attached are buffered in the
//! queue until one (re)attaches.

use super::{
    transport_error, Acker, Broker, Channel, Connection, Consumer, ConsumerHandle, Delivery,
    Exchange, ExchangeKind, OutgoingMessage, Queue, QueueSpec,
};
use crate::config::TransportConfig;
use crate::error::{Result, RpcError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Does `routing_key` match a topic binding `pattern`?
///
/// Both are split on `.`; `*` matches exactly one word and `#` matches zero or
/// more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && match_words(rest, tail),
            None => false,
        },
    }
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    /// (binding key, queue name)
    bindings: Vec<(String, String)>,
}

impl ExchangeState {
    fn routes(&self, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for (key, queue) in &self.bindings {
            let matched = match self.kind {
                ExchangeKind::Topic => topic_matches(key, routing_key),
                ExchangeKind::Direct => key == routing_key,
            };
            if matched && !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        queues
    }
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    tx: mpsc::UnboundedSender<Delivery>,
    /// Shared by every consumer; outlives any one of them.
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            durable,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

impl BrokerState {
    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(_, queue)| queue != name);
        }
    }
}

/// Broker living entirely inside the current process.
///
/// Clones share the same exchanges and queues, so a service node and a caller
/// node built from clones of one broker can talk to each other.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    acks: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deliveries acknowledged so far.
    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Names of all declared queues, sorted.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Binding keys attached to `queue` on `exchange`.
    pub async fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .exchanges
            .get(exchange)
            .map(|state| {
                state
                    .bindings
                    .iter()
                    .filter(|(_, bound)| bound == queue)
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        debug!("Opening in-memory connection (requested {})", url);
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            exclusive_queues: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    exclusive_queues: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn channel(&self) -> Result<Arc<dyn Channel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::NotConnected);
        }
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            exclusive_queues: self.exclusive_queues.clone(),
            closed: self.closed.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let owned = std::mem::take(&mut *self.exclusive_queues.lock().await);
        let mut state = self.broker.state.lock().await;
        for queue in owned {
            debug!("Deleting exclusive queue {}", queue);
            state.remove_queue(&queue);
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    exclusive_queues: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RpcError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        durable: bool,
        kind: ExchangeKind,
    ) -> Result<Arc<dyn Exchange>> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => {
                return Err(transport_error(format!(
                    "Exchange {} already declared with different properties",
                    name
                )));
            }
            Some(_) => {}
            None => {
                debug!("Declared {:?} exchange {}", kind, name);
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
            }
        }

        Ok(Arc::new(MemoryExchange {
            name: name.to_string(),
            broker: self.broker.clone(),
        }))
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<Arc<dyn Queue>> {
        self.ensure_open()?;
        let name = match spec {
            QueueSpec::Named { name, durable } => {
                let mut state = self.broker.state.lock().await;
                match state.queues.get(&name) {
                    Some(existing) if existing.durable != durable => {
                        return Err(transport_error(format!(
                            "Queue {} already declared with different durability",
                            name
                        )));
                    }
                    Some(_) => {}
                    None => {
                        debug!("Declared queue {}", name);
                        state.queues.insert(name.clone(), QueueState::new(durable));
                    }
                }
                name
            }
            QueueSpec::Exclusive => {
                let name = format!(
                    "{}{}",
                    TransportConfig::GENERATED_QUEUE_PREFIX,
                    Uuid::new_v4().simple()
                );
                self.broker
                    .state
                    .lock()
                    .await
                    .queues
                    .insert(name.clone(), QueueState::new(false));
                self.exclusive_queues.lock().await.push(name.clone());
                debug!("Declared exclusive queue {}", name);
                name
            }
        };

        Ok(Arc::new(MemoryQueue {
            name,
            broker: self.broker.clone(),
        }))
    }
}

struct MemoryExchange {
    name: String,
    broker: MemoryBroker,
}

#[async_trait]
impl Exchange for MemoryExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: OutgoingMessage, routing_key: &str) -> Result<()> {
        let state = self.broker.state.lock().await;
        let exchange = state
            .exchanges
            .get(&self.name)
            .ok_or_else(|| transport_error(format!("Exchange {} no longer exists", self.name)))?;

        let targets = exchange.routes(routing_key);
        if targets.is_empty() {
            debug!(
                "Dropping unroutable message on {} with key {}",
                self.name, routing_key
            );
            return Ok(());
        }

        for queue in targets {
            let Some(queue_state) = state.queues.get(&queue) else {
                continue;
            };
            let acker: Arc<dyn Acker> = Arc::new(MemoryAcker {
                acks: self.broker.acks.clone(),
                done: AtomicBool::new(false),
            });
            let delivery = Delivery::new(message.clone(), routing_key).with_acker(acker);
            if queue_state.tx.send(delivery).is_err() {
                debug!("Queue {} is closed; message dropped", queue);
            }
        }
        Ok(())
    }
}

struct MemoryQueue {
    name: String,
    broker: MemoryBroker,
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bind(&self, exchange: &dyn Exchange, routing_key: &str) -> Result<()> {
        let mut state = self.broker.state.lock().await;
        if !state.queues.contains_key(&self.name) {
            return Err(transport_error(format!("Queue {} does not exist", self.name)));
        }
        let target = state.exchanges.get_mut(exchange.name()).ok_or_else(|| {
            transport_error(format!("Exchange {} does not exist", exchange.name()))
        })?;

        let binding = (routing_key.to_string(), self.name.clone());
        if !target.bindings.contains(&binding) {
            debug!(
                "Bound queue {} to {} with key {}",
                self.name,
                exchange.name(),
                routing_key
            );
            target.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, consumer: Arc<dyn Consumer>) -> Result<ConsumerHandle> {
        let rx = {
            let state = self.broker.state.lock().await;
            let queue = state
                .queues
                .get(&self.name)
                .ok_or_else(|| transport_error(format!("Queue {} does not exist", self.name)))?;
            queue.rx.clone()
        };

        let queue = self.name.clone();
        let task = tokio::spawn(async move {
            loop {
                // The receiver lock is held only while waiting, so other
                // consumers pick up the next delivery while this one works.
                let next = rx.lock().await.recv().await;
                let Some(delivery) = next else {
                    break;
                };
                if let Err(e) = consumer.on_message(&delivery).await {
                    warn!("Consumer on {} failed: {}", queue, e);
                }
            }
            debug!("Consume loop for {} finished", queue);
        });

        Ok(ConsumerHandle::new(self.name.clone(), task))
    }
}

struct MemoryAcker {
    acks: Arc<AtomicUsize>,
    done: AtomicBool,
}

impl Acker for MemoryAcker {
    fn ack(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }
    }
}
