//! Outbox relay
//!
//! Drains due outbox records through the broker on a fixed interval and
//! prunes old SENT records on a slower one. Several relays may share a store;
//! the store's lease-based claim keeps them from sending the same record.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{OutboxMessage, OutboxStatus, OutboxStore, StoreError};
use crate::broker::{BrokerError, MessageBroker};
use crate::reliability::BackoffPolicy;
use crate::serde_util::duration_millis;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interval between relay cycles
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum records claimed per cycle
    pub batch_size: usize,

    /// How long a claim stays exclusive
    #[serde(with = "duration_millis")]
    pub lease: Duration,

    /// Upper bound for a single publish call, capped at half the lease
    #[serde(with = "duration_millis")]
    pub publish_timeout: Duration,

    /// Delay before the first republish
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Cap on the republish delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// How long SENT records are kept
    #[serde(with = "duration_millis")]
    pub sent_retention: Duration,

    /// Interval between cleanup passes
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            lease: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            sent_retention: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the claim lease
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the publish timeout
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Set the republish backoff bounds
    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }

    /// Set the retention for SENT records
    pub fn with_sent_retention(mut self, retention: Duration) -> Self {
        self.sent_retention = retention;
        self
    }

    /// Set the cleanup interval
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Publish timeout actually applied
    ///
    /// A publish must finish well inside the claim lease, otherwise another
    /// relay can reclaim the record while it is still in flight.
    pub fn effective_publish_timeout(&self) -> Duration {
        self.publish_timeout.min(self.lease / 2)
    }

    /// Backoff schedule for transient publish failures
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::exponential()
            .with_initial_delay(self.base_delay)
            .with_max_delay(self.max_delay)
    }
}

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Relay already running
    #[error("outbox relay is already running")]
    AlreadyRunning,
}

/// What one relay cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCycleReport {
    /// Records claimed
    pub claimed: usize,
    /// Records published and marked SENT
    pub sent: usize,
    /// Records that reached FAILED
    pub failed: usize,
    /// Records rescheduled after a transient failure
    pub rescheduled: usize,
    /// Records released untouched because the circuit was open
    pub deferred: usize,
    /// Records released unpublished because their claim was about to lapse
    pub expired: usize,
}

impl RelayCycleReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// Cumulative relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    pub cycles: u64,
    pub sent: u64,
    pub failed: u64,
    pub rescheduled: u64,
    pub deferred: u64,
    pub expired: u64,
}

#[derive(Default)]
struct RelayCounters {
    cycles: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    rescheduled: AtomicU64,
    deferred: AtomicU64,
    expired: AtomicU64,
}

impl RelayCounters {
    fn record(&self, report: &RelayCycleReport) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.sent.fetch_add(report.sent as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        self.rescheduled
            .fetch_add(report.rescheduled as u64, Ordering::Relaxed);
        self.deferred
            .fetch_add(report.deferred as u64, Ordering::Relaxed);
        self.expired
            .fetch_add(report.expired as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RelayStats {
        RelayStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

enum RecordOutcome {
    Sent,
    Failed,
    Rescheduled,
    Deferred,
    Expired,
    ClaimLost,
}

/// State shared between the relay handle and its background loops
struct RelayCore {
    relay_id: String,
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    config: RelayConfig,
    backoff: BackoffPolicy,
    counters: RelayCounters,
}

impl RelayCore {
    async fn run_cycle(&self) -> Result<RelayCycleReport, RelayError> {
        let batch = self
            .store
            .claim_batch(&self.relay_id, self.config.batch_size, self.config.lease)
            .await?;

        let mut report = RelayCycleReport {
            claimed: batch.len(),
            ..Default::default()
        };

        for record in &batch {
            match self.relay_one(record).await {
                Ok(RecordOutcome::Sent) => report.sent += 1,
                Ok(RecordOutcome::Failed) => report.failed += 1,
                Ok(RecordOutcome::Rescheduled) => report.rescheduled += 1,
                Ok(RecordOutcome::Deferred) => report.deferred += 1,
                Ok(RecordOutcome::Expired) => report.expired += 1,
                Ok(RecordOutcome::ClaimLost) => {
                    warn!(id = %record.id, "outbox claim lost before update");
                }
                Err(e) => {
                    // The lease expires and another cycle picks the record up
                    error!(id = %record.id, "Failed to update outbox record: {}", e);
                }
            }
        }

        self.counters.record(&report);
        if !report.is_empty() {
            info!(
                relay_id = %self.relay_id,
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                rescheduled = report.rescheduled,
                deferred = report.deferred,
                expired = report.expired,
                "relay cycle complete"
            );
        }

        Ok(report)
    }

    async fn relay_one(&self, record: &OutboxMessage) -> Result<RecordOutcome, StoreError> {
        let publish_timeout = self.config.effective_publish_timeout();

        // Earlier records in the batch may have eaten most of the lease
        let now = Utc::now();
        if !record.claim_covers(now, publish_timeout) {
            debug!(id = %record.id, "claim too close to expiry, releasing record");
            let updated = self.store.release(record.id, &self.relay_id, now).await?;
            return Ok(if updated {
                RecordOutcome::Expired
            } else {
                RecordOutcome::ClaimLost
            });
        }

        let message = record.to_workflow_message();
        let result = match tokio::time::timeout(
            publish_timeout,
            self.broker.publish(&record.destination_topic, &message),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BrokerError::transient(format!(
                "publish timed out after {:?}",
                publish_timeout
            ))),
        };

        let now = Utc::now();
        match result {
            Ok(_) => {
                let updated = self.store.mark_sent(record.id, &self.relay_id, now).await?;
                Ok(if updated {
                    RecordOutcome::Sent
                } else {
                    RecordOutcome::ClaimLost
                })
            }
            Err(BrokerError::CircuitOpen(e)) => {
                // The broker was never called, so no attempt is consumed
                debug!(id = %record.id, breaker = %e.name, "circuit open, deferring record");
                let next = now + chrono::Duration::from_std(self.config.base_delay).unwrap_or_default();
                let updated = self.store.release(record.id, &self.relay_id, next).await?;
                Ok(if updated {
                    RecordOutcome::Deferred
                } else {
                    RecordOutcome::ClaimLost
                })
            }
            Err(e) => {
                let update = record.after_failure(&e, &self.backoff, now);
                let updated = self
                    .store
                    .record_failure(record.id, &self.relay_id, &update)
                    .await?;
                if !updated {
                    return Ok(RecordOutcome::ClaimLost);
                }

                if update.status == OutboxStatus::Failed {
                    warn!(
                        id = %record.id,
                        topic = %record.destination_topic,
                        attempts = update.attempts,
                        error = %e,
                        "outbox record failed permanently"
                    );
                    Ok(RecordOutcome::Failed)
                } else {
                    warn!(
                        id = %record.id,
                        topic = %record.destination_topic,
                        attempts = update.attempts,
                        next_attempt_at = %update.next_attempt_at,
                        error = %e,
                        "publish failed, rescheduling outbox record"
                    );
                    Ok(RecordOutcome::Rescheduled)
                }
            }
        }
    }

    async fn cleanup(&self) -> Result<u64, RelayError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.config.sent_retention).unwrap_or_default();
        let deleted = self.store.delete_sent_before(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "pruned sent outbox records");
        }
        Ok(deleted)
    }
}

/// Background relay from the outbox store to the broker
///
/// # Example
///
/// ```ignore
/// use stepflow::outbox::{OutboxRelay, RelayConfig};
///
/// let relay = OutboxRelay::new(store, broker, RelayConfig::default());
/// relay.start()?;
///
/// // ... later
/// relay.stop().await;
/// ```
pub struct OutboxRelay {
    core: Arc<RelayCore>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    cycle_handle: Mutex<Option<JoinHandle<()>>>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl OutboxRelay {
    /// Create a relay publishing through `broker`
    ///
    /// Pass a circuit-breaker-wrapped broker so an outage defers records
    /// instead of burning their attempts.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        config: RelayConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let backoff = config.backoff();

        Self {
            core: Arc::new(RelayCore {
                relay_id: format!("relay-{}", Uuid::now_v7()),
                store,
                broker,
                config,
                backoff,
                counters: RelayCounters::default(),
            }),
            running: AtomicBool::new(false),
            shutdown_tx,
            cycle_handle: Mutex::new(None),
            cleanup_handle: Mutex::new(None),
        }
    }

    /// Claimant identity of this relay instance
    pub fn relay_id(&self) -> &str {
        &self.core.relay_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.core.config
    }

    /// Cumulative counters since creation
    pub fn stats(&self) -> RelayStats {
        self.core.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Claim one batch and try to publish every record in it
    ///
    /// Fails only when the batch cannot be claimed; per-record problems are
    /// logged and reflected in the report.
    #[instrument(skip(self), fields(relay_id = %self.core.relay_id))]
    pub async fn run_cycle(&self) -> Result<RelayCycleReport, RelayError> {
        self.core.run_cycle().await
    }

    /// Delete SENT records older than the retention period
    pub async fn cleanup(&self) -> Result<u64, RelayError> {
        self.core.cleanup().await
    }

    /// Start the relay and cleanup loops
    pub fn start(&self) -> Result<(), RelayError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }
        self.shutdown_tx.send_replace(false);

        info!(
            relay_id = %self.core.relay_id,
            poll_interval_ms = self.core.config.poll_interval.as_millis() as u64,
            batch_size = self.core.config.batch_size,
            "Starting outbox relay"
        );

        *self.cycle_handle.lock() = Some(self.spawn_cycle_loop());
        *self.cleanup_handle.lock() = Some(self.spawn_cleanup_loop());
        Ok(())
    }

    /// Stop both loops and wait for the current cycle to finish
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(true);

        let handles = [self.cycle_handle.lock().take(), self.cleanup_handle.lock().take()];
        for handle in handles.into_iter().flatten() {
            if let Err(e) = handle.await {
                error!("Relay loop terminated abnormally: {}", e);
            }
        }

        info!(relay_id = %self.core.relay_id, "Outbox relay stopped");
    }

    fn spawn_cycle_loop(&self) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = core.run_cycle().await {
                            error!("Relay cycle failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Relay loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_cleanup_loop(&self) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(core.config.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = core.cleanup().await {
                            error!("Outbox cleanup failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Cleanup loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

impl Drop for OutboxRelay {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
