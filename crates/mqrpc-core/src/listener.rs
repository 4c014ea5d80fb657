//! Broker consumers for inbound requests and inbound replies.
//!
//! Both listeners acknowledge every delivery once it has been handled, whatever
//! the outcome, and never ask the broker to requeue. Failures are logged here or
//! by the consume loop; they never stop the loop.

use crate::correlation::CorrelationRegistry;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, RpcError};
use crate::transport::{Consumer, Delivery, Exchange, OutgoingMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Feeds requests from a method queue into a [`Dispatcher`] and publishes the
/// replies to each request's reply-to address.
pub struct RequestListener {
    dispatcher: Arc<Dispatcher>,
    exchange: Arc<dyn Exchange>,
}

impl RequestListener {
    pub fn new(dispatcher: Arc<Dispatcher>, exchange: Arc<dyn Exchange>) -> Self {
        Self {
            dispatcher,
            exchange,
        }
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let reply_to = delivery
            .reply_to
            .as_deref()
            .ok_or(RpcError::MissingProperty { field: "reply_to" })?;
        let body = delivery.body_str()?;

        let Some(reply) = self.dispatcher.dispatch(body).await else {
            debug!("No reply for delivery on {}", delivery.routing_key);
            return Ok(());
        };

        let mut message = OutgoingMessage::json(reply);
        if let Some(token) = &delivery.correlation_id {
            message = message.with_correlation_id(token.as_str());
        }
        self.exchange.publish(message, reply_to).await
    }
}

#[async_trait]
impl Consumer for RequestListener {
    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        let outcome = self.handle(delivery).await;
        delivery.ack();
        if let Err(e) = &outcome {
            error!("Dropping request on {}: {}", delivery.routing_key, e);
        }
        outcome
    }
}

/// Routes replies from the caller's reply queue to their pending calls.
pub struct ResponseListener {
    registry: Arc<CorrelationRegistry>,
}

impl ResponseListener {
    pub fn new(registry: Arc<CorrelationRegistry>) -> Self {
        Self { registry }
    }

    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        let token = delivery
            .correlation_id
            .as_deref()
            .ok_or(RpcError::MissingProperty {
                field: "correlation_id",
            })?;
        let body = delivery.body_str()?;
        self.registry.resolve(token, body.to_string()).await
    }
}

#[async_trait]
impl Consumer for ResponseListener {
    async fn on_message(&self, delivery: &Delivery) -> Result<()> {
        let outcome = self.handle(delivery).await;
        delivery.ack();
        match outcome {
            Ok(()) => {}
            Err(RpcError::UnknownCorrelation { token }) => {
                warn!("Dropping reply for unknown correlation id {}", token);
            }
            Err(e) => error!("Dropping reply: {}", e),
        }
        Ok(())
    }
}
