//! OutboxStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{AttemptUpdate, OutboxCounts, OutboxMessage};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Record not found
    #[error("outbox record not found: {0}")]
    NotFound(Uuid),

    /// Record id already present
    #[error("outbox record already exists: {0}")]
    Duplicate(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable storage for outbox records
///
/// Implementations must make [`claim_batch`](Self::claim_batch) exclusive
/// across concurrent relays: a record claimed by one relay is invisible to
/// every other relay until its lease expires or the claim is resolved.
/// Status updates are guarded by the claim and only apply to PENDING
/// records, so terminal records are never mutated again.
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    // =========================================================================
    // Staging
    // =========================================================================

    /// Insert a new PENDING record
    async fn insert(&self, message: &OutboxMessage) -> Result<(), StoreError>;

    /// Load a record
    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, StoreError>;

    // =========================================================================
    // Relay
    // =========================================================================

    /// Claim up to `limit` due records for `claimant`
    ///
    /// Due means PENDING, `next_attempt_at <= now` and no live lease.
    /// Records are returned ordered by `(next_attempt_at, created_at)`.
    async fn claim_batch(
        &self,
        claimant: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Mark a claimed record SENT
    ///
    /// Returns `false` if the claim was lost or the record is no longer PENDING.
    async fn mark_sent(
        &self,
        id: Uuid,
        claimant: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Apply a failed attempt to a claimed record and release the claim
    async fn record_failure(
        &self,
        id: Uuid,
        claimant: &str,
        update: &AttemptUpdate,
    ) -> Result<bool, StoreError>;

    /// Release a claim without consuming an attempt
    async fn release(
        &self,
        id: Uuid,
        claimant: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Maintenance and health
    // =========================================================================

    /// Count records by status
    async fn counts(&self) -> Result<OutboxCounts, StoreError>;

    /// Delete SENT records sent before `cutoff`
    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
