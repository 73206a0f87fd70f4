//! In-memory log-based broker
//!
//! Models a partitioned, append-only log in the style of Kafka:
//! - Messages are routed to a partition by workflow id, so one workflow
//!   instance stays ordered within its partition
//! - Each subscription reads every partition from offset 0 with one consumer
//!   per partition, processing deliveries sequentially
//! - Acknowledging (or rejecting without requeue) commits past the offset;
//!   rejecting with requeue leaves the offset uncommitted, so the same record
//!   is delivered again

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::context::ChannelAcknowledger;
use super::{
    Ack, BrokerConfig, BrokerError, DeliveryMetadata, MessageBroker, MessageContext,
    MessageHandler, Resolution, WorkflowMessage,
};

/// One topic: a fixed set of append-only partitions
struct TopicLog {
    partitions: Vec<Mutex<Vec<WorkflowMessage>>>,
    appended: Notify,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            appended: Notify::new(),
        }
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as u32
    }

    fn append(&self, partition: u32, message: WorkflowMessage) -> u64 {
        let mut log = self.partitions[partition as usize].lock();
        log.push(message);
        (log.len() - 1) as u64
    }

    fn read(&self, partition: u32, offset: u64) -> Option<WorkflowMessage> {
        self.partitions[partition as usize]
            .lock()
            .get(offset as usize)
            .cloned()
    }
}

/// In-memory log-based broker
///
/// # Example
///
/// ```ignore
/// use stepflow::broker::{message_handler, BrokerConfig, InMemoryLogBroker, MessageBroker};
///
/// let broker = InMemoryLogBroker::new(BrokerConfig::default());
/// broker
///     .subscribe("orders.validate", message_handler(|msg, ctx| async move {
///         // process msg ...
///         let _ = ctx.acknowledge();
///     }))
///     .await?;
/// ```
pub struct InMemoryLogBroker {
    config: BrokerConfig,
    topics: RwLock<HashMap<String, Arc<TopicLog>>>,
    available: AtomicBool,
    closed: AtomicBool,
    consumers: TaskTracker,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl InMemoryLogBroker {
    /// Create a new broker
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            topics: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            consumers: TaskTracker::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Simulate the broker going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// All records of a topic, partition by partition (for testing)
    pub fn messages(&self, topic: &str) -> Vec<WorkflowMessage> {
        self.topics
            .read()
            .get(topic)
            .map(|log| {
                log.partitions
                    .iter()
                    .flat_map(|p| p.lock().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn topic(&self, topic: &str) -> Arc<TopicLog> {
        if let Some(log) = self.topics.read().get(topic) {
            return Arc::clone(log);
        }
        let mut topics = self.topics.write();
        Arc::clone(
            topics
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(TopicLog::new(self.config.partitions))),
        )
    }

    fn spawn_partition_consumer(
        &self,
        topic: String,
        log: Arc<TopicLog>,
        partition: u32,
        handler: MessageHandler,
    ) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let idle_poll = self.config.idle_poll_interval;
        let redelivery_delay = self.config.redelivery_delay;

        self.consumers.spawn(async move {
            let mut committed: u64 = 0;

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let Some(message) = log.read(partition, committed) else {
                    tokio::select! {
                        _ = log.appended.notified() => {}
                        _ = tokio::time::sleep(idle_poll) => {}
                        changed = shutdown_rx.changed() => {
                            // Sender gone: the broker itself was dropped
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                };

                let (acknowledger, resolution) = ChannelAcknowledger::new();
                let ctx = MessageContext::new(
                    topic.clone(),
                    DeliveryMetadata::Log {
                        partition,
                        offset: committed,
                    },
                    acknowledger,
                );

                handler(message, ctx).await;

                match resolution.await {
                    Ok(Resolution::Acknowledged) | Ok(Resolution::Rejected { requeue: false }) => {
                        committed += 1;
                    }
                    Ok(Resolution::Rejected { requeue: true }) | Err(_) => {
                        debug!(%topic, partition, offset = committed, "offset not committed, redelivering");
                        tokio::time::sleep(redelivery_delay).await;
                    }
                }
            }

            debug!(%topic, partition, "partition consumer exited");
        });
    }
}

#[async_trait]
impl MessageBroker for InMemoryLogBroker {
    async fn publish(&self, topic: &str, message: &WorkflowMessage) -> Result<Ack, BrokerError> {
        if topic.is_empty() {
            return Err(BrokerError::permanent("topic must not be empty"));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::permanent("broker is closed"));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::transient("log broker unavailable"));
        }

        let log = self.topic(topic);
        let partition = log.partition_for(&message.key());
        let offset = log.append(partition, message.clone());
        log.appended.notify_waiters();

        debug!(topic, partition, offset, workflow_id = %message.workflow_id, "appended message");
        Ok(Ack {
            topic: topic.to_string(),
            partition: Some(partition),
            offset,
        })
    }

    #[instrument(skip(self, handler))]
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::permanent("broker is closed"));
        }

        let log = self.topic(topic);
        for partition in 0..log.partitions.len() as u32 {
            self.spawn_partition_consumer(
                topic.to_string(),
                Arc::clone(&log),
                partition,
                Arc::clone(&handler),
            );
        }

        info!(topic, partitions = log.partitions.len(), "subscribed to log topic");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);
        self.consumers.close();

        if tokio::time::timeout(self.config.close_timeout, self.consumers.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.consumers.len(),
                "log broker consumers did not stop in time"
            );
        }

        info!("log broker closed");
        Ok(())
    }

    fn broker_type(&self) -> &str {
        "log"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }
}
