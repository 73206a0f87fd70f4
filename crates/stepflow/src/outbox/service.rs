//! Outbox staging

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::{OutboxKind, OutboxMessage, OutboxStore, StoreError};
use crate::broker::WorkflowMessage;

/// Stages outgoing workflow messages for the relay
///
/// Callers that own a database transaction build the record with
/// [`OutboxService::record`] and insert it on their own connection (see
/// `PostgresOutboxStore::insert_with`); everyone else uses
/// [`OutboxService::stage`].
#[derive(Clone)]
pub struct OutboxService {
    store: Arc<dyn OutboxStore>,
    max_attempts: u32,
}

impl OutboxService {
    /// Create a service writing records with the given publish budget
    pub fn new(store: Arc<dyn OutboxStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    /// Publish budget assigned to new records
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Build a PENDING record without persisting it
    pub fn record(
        &self,
        message: &WorkflowMessage,
        kind: OutboxKind,
        not_before: Option<DateTime<Utc>>,
    ) -> OutboxMessage {
        OutboxMessage::pending(message, kind, self.max_attempts, not_before)
    }

    /// Persist a PENDING record for `message`
    ///
    /// `not_before` holds the record back from relays until that instant.
    #[instrument(skip(self, message), fields(workflow_id = %message.workflow_id, topic = %message.step_topic))]
    pub async fn stage(
        &self,
        message: &WorkflowMessage,
        kind: OutboxKind,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<OutboxMessage, StoreError> {
        let record = self.record(message, kind, not_before);
        self.store.insert(&record).await?;

        debug!(
            id = %record.id,
            kind = %kind,
            next_attempt_at = %record.next_attempt_at,
            "staged outbox message"
        );
        Ok(record)
    }
}
