//! Reliability patterns for broker calls
//!
//! This module provides:
//! - [`BackoffPolicy`] - Exponential backoff with jitter
//! - [`CircuitBreaker`] - Per-broker-identity circuit breaker
//! - [`CircuitBreakerRegistry`] - Named breakers sharing one configuration
//! - [`ResilientBroker`] - Broker wrapper routing calls through a breaker

mod backoff;
mod circuit_breaker;
mod resilient;

pub use backoff::BackoffPolicy;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpenError,
    CircuitPermit, CircuitSnapshot, CircuitState,
};
pub use resilient::{ResilientBroker, DEFAULT_CALL_TIMEOUT};
