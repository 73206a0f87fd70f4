//! Circuit-breaker-wrapped broker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
use crate::broker::{Ack, BrokerError, MessageBroker, MessageHandler, WorkflowMessage};

/// Broker decorator that routes every publish through a circuit breaker
///
/// Transient failures count against the breaker; permanent failures pass
/// through without affecting it. While the circuit is open, publish fails
/// fast with [`BrokerError::CircuitOpen`] and the delegate is not called.
/// A delegate call that outlives the call timeout is abandoned and counted
/// as a transient failure, so a hanging broker trips the circuit too.
pub struct ResilientBroker {
    delegate: Arc<dyn MessageBroker>,
    breaker: Arc<CircuitBreaker>,
    call_timeout: Duration,
}

/// Default upper bound for one delegate publish
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

impl ResilientBroker {
    /// Wrap `delegate` with the breaker registered as `broker-<type>`
    pub fn new(delegate: Arc<dyn MessageBroker>, breakers: &CircuitBreakerRegistry) -> Self {
        let breaker = breakers.get_or_create(&Self::breaker_name(delegate.as_ref()));
        Self::with_breaker(delegate, breaker)
    }

    /// Wrap `delegate` with an explicit breaker
    pub fn with_breaker(delegate: Arc<dyn MessageBroker>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            delegate,
            breaker,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Set the upper bound for one delegate publish
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Breaker identity used for a broker
    pub fn breaker_name(broker: &dyn MessageBroker) -> String {
        format!("broker-{}", broker.broker_type())
    }

    /// The breaker guarding this broker
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Current circuit state
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

#[async_trait]
impl MessageBroker for ResilientBroker {
    #[instrument(skip(self, message), fields(breaker = %self.breaker.name()))]
    async fn publish(&self, topic: &str, message: &WorkflowMessage) -> Result<Ack, BrokerError> {
        let permit = self.breaker.allow()?;

        let result =
            match tokio::time::timeout(self.call_timeout, self.delegate.publish(topic, message))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(BrokerError::transient(format!(
                    "publish timed out after {:?}",
                    self.call_timeout
                ))),
            };

        match result {
            Ok(ack) => {
                permit.success();
                Ok(ack)
            }
            Err(e) if e.is_permanent() => {
                permit.ignore();
                Err(e)
            }
            Err(e) => {
                debug!(topic, error = %e, "publish failed, recording against circuit");
                permit.failure();
                Err(e)
            }
        }
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        self.delegate.subscribe(topic, handler).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.delegate.close().await
    }

    fn broker_type(&self) -> &str {
        self.delegate.broker_type()
    }

    fn is_available(&self) -> bool {
        self.breaker.state() != CircuitState::Open && self.delegate.is_available()
    }
}
