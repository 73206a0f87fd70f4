//! Per-delivery message context
//!
//! A [`MessageContext`] is handed to the subscriber together with each
//! delivered message. Resolving it consumes it, so a context can be resolved
//! at most once; a context that is dropped unresolved is rejected with
//! requeue and logged.

use std::fmt;

use tokio::sync::oneshot;
use tracing::error;

use super::BrokerError;

/// Broker-native delivery metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMetadata {
    /// Log-based broker position
    Log { partition: u32, offset: u64 },

    /// Queue-based broker delivery
    Queue { delivery_tag: u64, redelivered: bool },
}

/// How a delivery was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Processing finished, the broker may forget the message
    Acknowledged,

    /// Processing refused; `requeue` asks the broker to deliver it again
    Rejected { requeue: bool },
}

/// Broker-side half of a delivery, implemented once per adapter
pub trait Acknowledger: Send + 'static {
    /// Tell the broker how the delivery was resolved
    fn resolve(&mut self, resolution: Resolution) -> Result<(), BrokerError>;
}

/// Handle for one received message
pub struct MessageContext {
    destination: String,
    metadata: DeliveryMetadata,
    acknowledger: Option<Box<dyn Acknowledger>>,
}

impl MessageContext {
    /// Create a context for a delivery on `destination`
    pub fn new(
        destination: impl Into<String>,
        metadata: DeliveryMetadata,
        acknowledger: impl Acknowledger,
    ) -> Self {
        Self {
            destination: destination.into(),
            metadata,
            acknowledger: Some(Box::new(acknowledger)),
        }
    }

    /// Topic or queue the message was received from
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Broker-native metadata (partition/offset or delivery tag)
    pub fn metadata(&self) -> DeliveryMetadata {
        self.metadata
    }

    /// Offset of the delivery for log-based brokers
    pub fn offset(&self) -> Option<u64> {
        match self.metadata {
            DeliveryMetadata::Log { offset, .. } => Some(offset),
            DeliveryMetadata::Queue { .. } => None,
        }
    }

    /// Whether the broker flagged this delivery as a redelivery
    pub fn is_redelivery(&self) -> bool {
        matches!(
            self.metadata,
            DeliveryMetadata::Queue {
                redelivered: true,
                ..
            }
        )
    }

    /// Acknowledge successful processing
    pub fn acknowledge(mut self) -> Result<(), BrokerError> {
        self.resolve(Resolution::Acknowledged)
    }

    /// Reject the message, optionally asking for redelivery
    pub fn reject(mut self, requeue: bool) -> Result<(), BrokerError> {
        self.resolve(Resolution::Rejected { requeue })
    }

    fn resolve(&mut self, resolution: Resolution) -> Result<(), BrokerError> {
        match self.acknowledger.take() {
            Some(mut acknowledger) => acknowledger.resolve(resolution),
            None => Err(BrokerError::Permanent(format!(
                "delivery on {} already resolved",
                self.destination
            ))),
        }
    }
}

impl Drop for MessageContext {
    fn drop(&mut self) {
        if let Some(mut acknowledger) = self.acknowledger.take() {
            error!(
                destination = %self.destination,
                metadata = ?self.metadata,
                "message context dropped without resolution, rejecting with requeue"
            );
            if let Err(e) = acknowledger.resolve(Resolution::Rejected { requeue: true }) {
                error!(destination = %self.destination, "implicit reject failed: {}", e);
            }
        }
    }
}

impl fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageContext")
            .field("destination", &self.destination)
            .field("metadata", &self.metadata)
            .field("resolved", &self.acknowledger.is_none())
            .finish()
    }
}

/// Acknowledger that reports the resolution over a oneshot channel
///
/// Used by the in-memory adapters, whose consumer loops wait for the
/// resolution before moving to the next delivery.
pub(crate) struct ChannelAcknowledger {
    tx: Option<oneshot::Sender<Resolution>>,
}

impl ChannelAcknowledger {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Resolution>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }
}

impl Acknowledger for ChannelAcknowledger {
    fn resolve(&mut self, resolution: Resolution) -> Result<(), BrokerError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| BrokerError::Permanent("delivery already resolved".to_string()))?;
        // The consumer loop may be gone after close(); nothing left to tell it.
        let _ = tx.send(resolution);
        Ok(())
    }
}
