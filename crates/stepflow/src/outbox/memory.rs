//! In-memory implementation of OutboxStore

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{AttemptUpdate, OutboxCounts, OutboxMessage, OutboxStatus, OutboxStore, StoreError};

/// In-memory implementation of OutboxStore
///
/// Provides the same claim semantics as the PostgreSQL implementation; the
/// write lock makes claim-and-update atomic within one process.
///
/// # Example
///
/// ```
/// use stepflow::outbox::InMemoryOutboxStore;
///
/// let store = InMemoryOutboxStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryOutboxStore {
    records: RwLock<HashMap<Uuid, OutboxMessage>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// All records, oldest first (for testing)
    pub fn all(&self) -> Vec<OutboxMessage> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }

    /// Apply `f` to a PENDING record still claimed by `claimant`
    fn update_claimed<F>(&self, id: Uuid, claimant: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut OutboxMessage),
    {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if record.status != OutboxStatus::Pending
            || record.claimed_by.as_deref() != Some(claimant)
        {
            return Ok(false);
        }

        f(record);
        record.claimed_by = None;
        record.claim_expires_at = None;
        Ok(true)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, message: &OutboxMessage) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&message.id) {
            return Err(StoreError::Duplicate(message.id));
        }
        records.insert(message.id, message.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, StoreError> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        claimant: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(lease).unwrap_or_default();
        let mut records = self.records.write();

        let mut due: Vec<_> = records
            .values()
            .filter(|r| r.is_claimable(now))
            .map(|r| (r.next_attempt_at, r.created_at, r.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(record) = records.get_mut(&id) {
                record.claimed_by = Some(claimant.to_string());
                record.claim_expires_at = Some(expires_at);
                claimed.push(record.clone());
            }
        }

        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        claimant: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.update_claimed(id, claimant, |record| {
            record.status = OutboxStatus::Sent;
            record.attempts = record.attempts.saturating_add(1);
            record.last_attempt_at = Some(sent_at);
            record.sent_at = Some(sent_at);
        })
    }

    async fn record_failure(
        &self,
        id: Uuid,
        claimant: &str,
        update: &AttemptUpdate,
    ) -> Result<bool, StoreError> {
        self.update_claimed(id, claimant, |record| {
            record.status = update.status;
            record.attempts = update.attempts;
            record.last_attempt_at = Some(update.attempted_at);
            record.next_attempt_at = update.next_attempt_at;
            record.last_error = update.last_error.clone();
        })
    }

    async fn release(
        &self,
        id: Uuid,
        claimant: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.update_claimed(id, claimant, |record| {
            record.next_attempt_at = next_attempt_at;
        })
    }

    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let records = self.records.read();
        let mut counts = OutboxCounts::default();
        for record in records.values() {
            match record.status {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Sent => counts.sent += 1,
                OutboxStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, r| {
            !(r.status == OutboxStatus::Sent && r.sent_at.map_or(false, |sent| sent < cutoff))
        });
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, WorkflowMessage};
    use crate::outbox::OutboxKind;
    use crate::reliability::BackoffPolicy;

    const LEASE: Duration = Duration::from_secs(30);

    fn create_test_record(topic: &str) -> OutboxMessage {
        let msg = WorkflowMessage::new(Uuid::now_v7(), topic, serde_json::json!({}));
        OutboxMessage::pending(&msg, OutboxKind::Workflow, 3, None)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = InMemoryOutboxStore::new();
        let record = create_test_record("a");

        store.insert(&record).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap(), Some(record.clone()));
        assert!(matches!(
            store.insert(&record).await,
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.get(Uuid::now_v7()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claim_orders_by_next_attempt_then_created() {
        let store = InMemoryOutboxStore::new();
        let now = Utc::now();

        let mut first = create_test_record("first");
        first.next_attempt_at = now - chrono::Duration::seconds(10);
        let mut second = create_test_record("second");
        second.next_attempt_at = now - chrono::Duration::seconds(5);
        let mut third = create_test_record("third");
        third.next_attempt_at = second.next_attempt_at;
        third.created_at = second.created_at + chrono::Duration::milliseconds(1);
        let mut future = create_test_record("future");
        future.next_attempt_at = now + chrono::Duration::seconds(60);

        for record in [&third, &future, &second, &first] {
            store.insert(record).await.unwrap();
        }

        let claimed = store.claim_batch("relay-a", 10, LEASE).await.unwrap();
        let topics: Vec<_> = claimed.iter().map(|r| r.destination_topic.as_str()).collect();
        assert_eq!(topics, vec!["first", "second", "third"]);
        assert!(claimed.iter().all(|r| r.claimed_by.as_deref() == Some("relay-a")));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_lease_expires() {
        let store = InMemoryOutboxStore::new();
        store.insert(&create_test_record("a")).await.unwrap();

        let claimed = store
            .claim_batch("relay-a", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_batch("relay-b", 10, LEASE).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = store.claim_batch("relay-b", 10, LEASE).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        // The crashed relay's late update is rejected
        assert!(!store.mark_sent(claimed[0].id, "relay-a", Utc::now()).await.unwrap());
        assert!(store.mark_sent(claimed[0].id, "relay-b", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_records_are_not_mutated() {
        let store = InMemoryOutboxStore::new();
        let record = create_test_record("a");
        store.insert(&record).await.unwrap();

        store.claim_batch("relay-a", 1, LEASE).await.unwrap();
        assert!(store.mark_sent(record.id, "relay-a", Utc::now()).await.unwrap());

        let sent = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(sent.status, OutboxStatus::Sent);
        assert_eq!(sent.attempts, 1);
        assert!(sent.claimed_by.is_none());

        let update = sent.after_failure(
            &BrokerError::transient("late"),
            &BackoffPolicy::exponential(),
            Utc::now(),
        );
        assert!(!store.record_failure(record.id, "relay-a", &update).await.unwrap());
        assert!(store.claim_batch("relay-a", 1, LEASE).await.unwrap().is_empty());
        assert_eq!(store.get(record.id).await.unwrap().unwrap(), sent);
    }

    #[tokio::test]
    async fn test_record_failure_and_release() {
        let store = InMemoryOutboxStore::new();
        let record = create_test_record("a");
        store.insert(&record).await.unwrap();

        let claimed = store.claim_batch("relay-a", 1, LEASE).await.unwrap().remove(0);
        let update = claimed.after_failure(
            &BrokerError::transient("down"),
            &BackoffPolicy::fixed(Duration::ZERO),
            Utc::now(),
        );
        assert!(store.record_failure(record.id, "relay-a", &update).await.unwrap());

        let after = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(after.status, OutboxStatus::Pending);
        assert_eq!(after.attempts, 1);
        assert!(after.last_error.is_some());

        store.claim_batch("relay-a", 1, LEASE).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(60);
        assert!(store.release(record.id, "relay-a", later).await.unwrap());

        let released = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(released.attempts, 1);
        assert_eq!(released.next_attempt_at, later);
        assert!(store.claim_batch("relay-a", 1, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counts_and_cleanup() {
        let store = InMemoryOutboxStore::new();
        let records: Vec<_> = (0..3).map(|i| create_test_record(&format!("t{}", i))).collect();
        for record in &records {
            store.insert(record).await.unwrap();
        }

        store.claim_batch("relay-a", 10, LEASE).await.unwrap();
        let old = Utc::now() - chrono::Duration::hours(48);
        store.mark_sent(records[0].id, "relay-a", old).await.unwrap();
        store.mark_sent(records[1].id, "relay-a", Utc::now()).await.unwrap();
        let failed = records[2].after_failure(
            &BrokerError::permanent("bad"),
            &BackoffPolicy::exponential(),
            Utc::now(),
        );
        store.record_failure(records[2].id, "relay-a", &failed).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts, OutboxCounts { pending: 0, sent: 2, failed: 1 });

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(store.delete_sent_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.len(), 2);
        assert!(store.get(records[0].id).await.unwrap().is_none());
    }
}
