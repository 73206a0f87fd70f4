//! Transactional outbox
//!
//! Outgoing workflow messages are staged as durable records and published
//! by a background relay, so a broker outage delays delivery instead of
//! losing messages.

mod memory;
mod message;
mod postgres;
mod relay;
mod service;
mod store;

pub use memory::InMemoryOutboxStore;
pub use message::{AttemptUpdate, OutboxCounts, OutboxKind, OutboxMessage, OutboxStatus};
pub use postgres::{PostgresOutboxStore, MIGRATOR};
pub use relay::{OutboxRelay, RelayConfig, RelayCycleReport, RelayError, RelayStats};
pub use service::OutboxService;
pub use store::{OutboxStore, StoreError};
