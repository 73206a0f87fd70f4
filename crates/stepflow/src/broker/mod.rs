//! Broker port and adapters
//!
//! This module provides:
//! - [`MessageBroker`] - the port every broker backend implements
//! - [`WorkflowMessage`] / [`MessageContext`] - what subscribers receive
//! - [`InMemoryLogBroker`] - log-based adapter (partition/offset semantics)
//! - [`InMemoryQueueBroker`] - queue-based adapter (delivery tag semantics)
//! - [`BrokerConfig`] - selects and configures an adapter

mod backend;
mod context;
mod log;
mod message;
mod port;
mod queue;

pub use backend::{BrokerConfig, BrokerKind};
pub(crate) use context::ChannelAcknowledger;
pub use context::{Acknowledger, DeliveryMetadata, MessageContext, Resolution};
pub use log::InMemoryLogBroker;
pub use message::{
    WorkflowMessage, ATTEMPT_HEADER, ERROR_CODE_HEADER, ERROR_MESSAGE_HEADER,
    SOURCE_TOPIC_HEADER, TRACE_ID_HEADER,
};
pub use port::{message_handler, Ack, BrokerError, MessageBroker, MessageHandler};
pub use queue::InMemoryQueueBroker;
