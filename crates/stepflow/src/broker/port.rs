//! MessageBroker trait definition

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{MessageContext, WorkflowMessage};
use crate::reliability::CircuitOpenError;

/// Error type for broker operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    /// Network failure or broker unavailable; eligible for retry
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Malformed or unroutable message; never retried
    #[error("permanent broker error: {0}")]
    Permanent(String),

    /// The broker's circuit is open; the call never reached the broker
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl BrokerError {
    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Whether a later attempt may succeed
    ///
    /// An open circuit counts as transient: the caller backs off and retries
    /// on its own schedule.
    pub fn is_transient(&self) -> bool {
        !self.is_permanent()
    }

    /// Whether the error is terminal for the message
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Delivery acknowledgment returned by a successful publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Topic the message was written to
    pub topic: String,

    /// Partition, for log-based brokers
    pub partition: Option<u32>,

    /// Offset within the partition, or the queue sequence number
    pub offset: u64,
}

/// Callback invoked once per inbound message
///
/// The handler owns the [`MessageContext`] and must resolve it.
pub type MessageHandler =
    Arc<dyn Fn(WorkflowMessage, MessageContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`]
pub fn message_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(WorkflowMessage, MessageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message, ctx| Box::pin(handler(message, ctx)))
}

/// Broker port implemented once per broker product
///
/// `publish` must be safe to call concurrently.
#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Publish a message and wait for the broker's delivery acknowledgment
    async fn publish(&self, topic: &str, message: &WorkflowMessage) -> Result<Ack, BrokerError>;

    /// Register a handler invoked once per message delivered on `topic`
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError>;

    /// Stop all subscriptions and release broker resources
    async fn close(&self) -> Result<(), BrokerError>;

    /// Broker product identifier (e.g. "log", "queue")
    fn broker_type(&self) -> &str;

    /// Whether the broker is currently reachable
    fn is_available(&self) -> bool;
}
