//! # Stepflow
//!
//! A broker-agnostic workflow orchestration core.
//!
//! ## Features
//!
//! - **Broker port**: one publish/subscribe contract with log-based and queue-based adapters
//! - **Circuit breakers**: every broker identity is guarded by a CLOSED / OPEN / HALF_OPEN breaker
//! - **Transactional outbox**: messages are staged durably and published by a background relay
//! - **Step engine**: per-message state machine with timeouts, retries, callbacks and dead-lettering
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionEngine                         │
//! │  (runs step handlers, records transitions, stages output)   │
//! └─────────────────────────────────────────────────────────────┘
//!              │ stage                          ▲ deliver
//!              ▼                                │
//! ┌────────────────────────────┐   ┌────────────────────────────┐
//! │        OutboxStore          │   │       MessageBroker         │
//! │ (PostgreSQL or in-memory)  │   │  (log or queue adapter)    │
//! └────────────────────────────┘   └────────────────────────────┘
//!              │ claim                          ▲ publish
//!              ▼                                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │             OutboxRelay  ──►  ResilientBroker                │
//! │  (leases batches, retries with backoff, trips the circuit)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stepflow::prelude::*;
//!
//! let registry = WorkflowRegistry::builder()
//!     .step(StepDefinition::builder("orders.charge", handler_fn(charge)).next("orders.ship"))
//!     .step(StepDefinition::builder("orders.ship", handler_fn(ship)))
//!     .build()?;
//!
//! let breakers = CircuitBreakerRegistry::default();
//! let broker: Arc<dyn MessageBroker> =
//!     Arc::new(ResilientBroker::new(BrokerConfig::default().build(), &breakers));
//! let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
//!
//! let engine = ExecutionEngine::new(
//!     Arc::new(registry),
//!     OutboxService::new(store.clone(), 5),
//!     Arc::new(InMemoryExecutionStore::new()),
//!     EngineConfig::default(),
//! );
//! engine.start(broker.as_ref()).await?;
//!
//! let relay = OutboxRelay::new(store, broker, RelayConfig::default());
//! relay.start()?;
//!
//! engine.start_workflow("orders.charge", json!({ "order_id": 42 })).await?;
//! ```

pub mod broker;
pub mod config;
pub mod engine;
pub mod health;
pub mod outbox;
pub mod reliability;
pub mod telemetry;
pub mod workflow;

mod serde_util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::broker::{
        BrokerConfig, BrokerError, BrokerKind, MessageBroker, MessageContext, WorkflowMessage,
    };
    pub use crate::config::StepflowConfig;
    pub use crate::engine::{
        EngineConfig, EngineError, ExecutionEngine, ExecutionStatus, ExecutionStore,
        InMemoryExecutionStore,
    };
    pub use crate::health::{HealthMonitor, HealthReport, HealthStatus};
    pub use crate::outbox::{
        InMemoryOutboxStore, OutboxRelay, OutboxService, OutboxStore, PostgresOutboxStore,
        RelayConfig,
    };
    pub use crate::reliability::{
        BackoffPolicy, CircuitBreakerConfig, CircuitBreakerRegistry, ResilientBroker,
    };
    pub use crate::workflow::{
        callback_fn, handler_fn, HandlerError, StepDefinition, StepOutcome, WorkflowRegistry,
    };
}

// Re-export key types at crate root
pub use broker::{BrokerConfig, BrokerError, BrokerKind, MessageBroker, WorkflowMessage};
pub use config::StepflowConfig;
pub use engine::{EngineConfig, EngineError, ExecutionEngine, ExecutionStatus};
pub use health::{HealthMonitor, HealthStatus};
pub use outbox::{
    InMemoryOutboxStore, OutboxRelay, OutboxService, OutboxStore, PostgresOutboxStore,
    RelayConfig, StoreError,
};
pub use reliability::{BackoffPolicy, CircuitBreakerConfig, CircuitBreakerRegistry, ResilientBroker};
pub use workflow::{HandlerError, StepDefinition, StepOutcome, WorkflowRegistry};
