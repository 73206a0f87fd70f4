//! In-memory queue-based broker
//!
//! Models a work queue in the style of RabbitMQ:
//! - One FIFO queue per topic; competing consumers share it
//! - Every delivery carries a monotonically increasing delivery tag
//! - Rejecting with requeue puts the message back at the head of the queue
//!   flagged as redelivered; rejecting without requeue discards it

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
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

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: WorkflowMessage,
    redelivered: bool,
}

/// One topic's queue with delivery counters
#[derive(Default)]
struct TopicQueue {
    messages: Mutex<VecDeque<QueuedMessage>>,
    enqueued: Notify,
    next_sequence: AtomicU64,
    next_delivery_tag: AtomicU64,
    total_acked: AtomicU64,
    total_discarded: AtomicU64,
}

impl TopicQueue {
    fn pop(&self) -> Option<QueuedMessage> {
        self.messages.lock().pop_front()
    }
}

/// In-memory queue-based broker
pub struct InMemoryQueueBroker {
    config: BrokerConfig,
    queues: RwLock<HashMap<String, Arc<TopicQueue>>>,
    available: AtomicBool,
    closed: AtomicBool,
    consumers: TaskTracker,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl InMemoryQueueBroker {
    /// Create a new broker
    pub fn new(config: BrokerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            queues: RwLock::new(HashMap::new()),
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

    /// Number of messages waiting in a queue (for testing)
    pub fn queue_length(&self, topic: &str) -> usize {
        self.queues
            .read()
            .get(topic)
            .map(|q| q.messages.lock().len())
            .unwrap_or(0)
    }

    /// Number of acknowledged deliveries on a queue
    pub fn acked_count(&self, topic: &str) -> u64 {
        self.queues
            .read()
            .get(topic)
            .map(|q| q.total_acked.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of deliveries rejected without requeue on a queue
    pub fn discarded_count(&self, topic: &str) -> u64 {
        self.queues
            .read()
            .get(topic)
            .map(|q| q.total_discarded.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn queue(&self, topic: &str) -> Arc<TopicQueue> {
        if let Some(queue) = self.queues.read().get(topic) {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write();
        Arc::clone(queues.entry(topic.to_string()).or_default())
    }

    fn spawn_consumer(&self, topic: String, queue: Arc<TopicQueue>, handler: MessageHandler) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let idle_poll = self.config.idle_poll_interval;
        let redelivery_delay = self.config.redelivery_delay;

        self.consumers.spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let Some(queued) = queue.pop() else {
                    tokio::select! {
                        _ = queue.enqueued.notified() => {}
                        _ = tokio::time::sleep(idle_poll) => {}
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                };

                let delivery_tag = queue.next_delivery_tag.fetch_add(1, Ordering::Relaxed) + 1;
                let (acknowledger, resolution) = ChannelAcknowledger::new();
                let ctx = MessageContext::new(
                    topic.clone(),
                    DeliveryMetadata::Queue {
                        delivery_tag,
                        redelivered: queued.redelivered,
                    },
                    acknowledger,
                );

                handler(queued.message.clone(), ctx).await;

                match resolution.await {
                    Ok(Resolution::Acknowledged) => {
                        queue.total_acked.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Resolution::Rejected { requeue: false }) => {
                        queue.total_discarded.fetch_add(1, Ordering::Relaxed);
                        debug!(%topic, delivery_tag, "message rejected without requeue");
                    }
                    Ok(Resolution::Rejected { requeue: true }) | Err(_) => {
                        queue.messages.lock().push_front(QueuedMessage {
                            message: queued.message,
                            redelivered: true,
                        });
                        debug!(%topic, delivery_tag, "message requeued");
                        tokio::time::sleep(redelivery_delay).await;
                    }
                }
            }

            debug!(%topic, "queue consumer exited");
        });
    }
}

#[async_trait]
impl MessageBroker for InMemoryQueueBroker {
    async fn publish(&self, topic: &str, message: &WorkflowMessage) -> Result<Ack, BrokerError> {
        if topic.is_empty() {
            return Err(BrokerError::permanent("queue name must not be empty"));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::permanent("broker is closed"));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::transient("queue broker unavailable"));
        }

        let queue = self.queue(topic);
        let sequence = queue.next_sequence.fetch_add(1, Ordering::Relaxed);
        queue.messages.lock().push_back(QueuedMessage {
            message: message.clone(),
            redelivered: false,
        });
        queue.enqueued.notify_one();

        debug!(topic, sequence, workflow_id = %message.workflow_id, "enqueued message");
        Ok(Ack {
            topic: topic.to_string(),
            partition: None,
            offset: sequence,
        })
    }

    #[instrument(skip(self, handler))]
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::permanent("broker is closed"));
        }

        let queue = self.queue(topic);
        let consumers = self.config.consumers_per_subscription.max(1);
        for _ in 0..consumers {
            self.spawn_consumer(topic.to_string(), Arc::clone(&queue), Arc::clone(&handler));
        }

        info!(topic, consumers, "subscribed to queue");
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
                "queue broker consumers did not stop in time"
            );
        }

        info!("queue broker closed");
        Ok(())
    }

    fn broker_type(&self) -> &str {
        "queue"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }
}
