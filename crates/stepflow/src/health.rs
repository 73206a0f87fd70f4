//! Health classification
//!
//! Derives UP / WARNING / DOWN from outbox counts, circuit states and
//! broker availability for an external reporting component.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::broker::MessageBroker;
use crate::outbox::{OutboxCounts, OutboxStore};
use crate::reliability::{CircuitBreakerRegistry, CircuitSnapshot, CircuitState};

/// Health classification, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Up,
    Warning,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Warning => "WARNING",
            Self::Down => "DOWN",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbox health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxHealth {
    pub status: HealthStatus,
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub total: u64,
    pub pending_threshold: u64,
    /// Set when the counts could not be read
    pub error: Option<String>,
}

impl OutboxHealth {
    /// DOWN if any record FAILED, WARNING if pending exceeds the threshold, else UP
    pub fn from_counts(counts: OutboxCounts, pending_threshold: u64) -> Self {
        let status = if counts.failed > 0 {
            HealthStatus::Down
        } else if counts.pending > pending_threshold {
            HealthStatus::Warning
        } else {
            HealthStatus::Up
        };

        Self {
            status,
            pending: counts.pending,
            sent: counts.sent,
            failed: counts.failed,
            total: counts.total(),
            pending_threshold,
            error: None,
        }
    }

    fn unavailable(error: String, pending_threshold: u64) -> Self {
        Self {
            error: Some(error),
            status: HealthStatus::Down,
            ..Self::from_counts(OutboxCounts::default(), pending_threshold)
        }
    }
}

/// DOWN if any circuit is OPEN, WARNING if any is HALF_OPEN, else UP
pub fn circuit_health(circuits: &[CircuitSnapshot]) -> HealthStatus {
    circuits
        .iter()
        .map(|c| match c.state {
            CircuitState::Open => HealthStatus::Down,
            CircuitState::HalfOpen => HealthStatus::Warning,
            CircuitState::Closed => HealthStatus::Up,
        })
        .max()
        .unwrap_or(HealthStatus::Up)
}

/// Broker connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerHealth {
    pub broker_type: String,
    pub available: bool,
}

/// Combined health of one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst of the outbox, circuit and broker classifications
    pub status: HealthStatus,
    pub outbox: OutboxHealth,
    pub circuit_status: HealthStatus,
    pub circuits: Vec<CircuitSnapshot>,
    pub broker: BrokerHealth,
    pub checked_at: DateTime<Utc>,
}

/// Assembles [`HealthReport`]s on demand
pub struct HealthMonitor {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    breakers: Arc<CircuitBreakerRegistry>,
    pending_threshold: u64,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        breakers: Arc<CircuitBreakerRegistry>,
        pending_threshold: u64,
    ) -> Self {
        Self {
            store,
            broker,
            breakers,
            pending_threshold,
        }
    }

    /// Outbox health alone
    pub async fn outbox(&self) -> OutboxHealth {
        match self.store.counts().await {
            Ok(counts) => OutboxHealth::from_counts(counts, self.pending_threshold),
            Err(e) => {
                error!("Failed to read outbox counts: {}", e);
                OutboxHealth::unavailable(e.to_string(), self.pending_threshold)
            }
        }
    }

    /// Full report
    pub async fn report(&self) -> HealthReport {
        let outbox = self.outbox().await;
        let circuits = self.breakers.snapshots();
        let circuit_status = circuit_health(&circuits);
        let broker = BrokerHealth {
            broker_type: self.broker.broker_type().to_string(),
            available: self.broker.is_available(),
        };
        let broker_status = if broker.available {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        };

        HealthReport {
            status: outbox.status.max(circuit_status).max(broker_status),
            outbox,
            circuit_status,
            circuits,
            broker,
            checked_at: Utc::now(),
        }
    }
}
