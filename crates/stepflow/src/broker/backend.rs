//! Broker backend selection

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{InMemoryLogBroker, InMemoryQueueBroker, MessageBroker};
use crate::serde_util::duration_millis;

/// Supported broker delivery models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// Partitioned log with committed offsets (Kafka-like)
    Log,

    /// Work queue with per-delivery ack/nack (RabbitMQ-like)
    Queue,
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log => write!(f, "log"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "log" | "kafka" => Ok(Self::Log),
            "queue" | "rabbitmq" | "amqp" => Ok(Self::Queue),
            other => Err(format!("unknown broker backend: {}", other)),
        }
    }
}

/// Broker adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Which adapter to build
    pub backend: BrokerKind,

    /// Partitions per topic (log backend)
    pub partitions: u32,

    /// Competing consumers per subscription (queue backend)
    pub consumers_per_subscription: usize,

    /// How often an idle consumer re-checks for messages
    #[serde(with = "duration_millis")]
    pub idle_poll_interval: Duration,

    /// Pause before redelivering a requeued message
    #[serde(with = "duration_millis")]
    pub redelivery_delay: Duration,

    /// How long close() waits for in-flight deliveries
    #[serde(with = "duration_millis")]
    pub close_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerKind::Log,
            partitions: 3,
            consumers_per_subscription: 1,
            idle_poll_interval: Duration::from_millis(50),
            redelivery_delay: Duration::from_millis(100),
            close_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// Create a configuration for the given backend
    pub fn new(backend: BrokerKind) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    /// Set the number of partitions per topic
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    /// Set the number of consumers per subscription
    pub fn with_consumers_per_subscription(mut self, consumers: usize) -> Self {
        self.consumers_per_subscription = consumers.max(1);
        self
    }

    /// Set the idle poll interval
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    /// Set the redelivery delay
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Build the configured adapter
    pub fn build(&self) -> Arc<dyn MessageBroker> {
        match self.backend {
            BrokerKind::Log => Arc::new(InMemoryLogBroker::new(self.clone())),
            BrokerKind::Queue => Arc::new(InMemoryQueueBroker::new(self.clone())),
        }
    }
}
