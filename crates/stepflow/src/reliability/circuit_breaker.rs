//! Circuit breaker
//!
//! One breaker per broker identity. State lives behind a mutex so every
//! transition is atomic under concurrent callers, and HALF_OPEN admits a
//! single trial call at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::serde_util::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if the broker recovered - one trial call allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Fast-fail signal returned while a circuit is open
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker {name} is open")]
pub struct CircuitOpenError {
    /// Name of the tripped breaker
    pub name: String,
}

impl CircuitOpenError {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  threshold failures  ┌─────────┐  open duration  ┌──────────┐
/// │ Closed  │ ───────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘   within window      └─────────┘                 └──────────┘
///      ▲                                ▲        trial fails         │
///      │                                └────────────────────────────┤
///      │                  trial succeeds                             │
///      └─────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use stepflow::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_open_duration(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within the window that open the circuit
    pub failure_threshold: u32,

    /// Sliding window for failure counting
    #[serde(with = "duration_millis")]
    pub window: Duration,

    /// Time spent open before a trial call is allowed
    #[serde(with = "duration_millis")]
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the sliding window for failure counting
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set how long the circuit stays open
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_transition_at: DateTime<Utc>,
    pub failure_threshold: u32,
    #[serde(with = "duration_millis")]
    pub open_duration: Duration,
}

struct BreakerState {
    state: CircuitState,
    /// Timestamps of the current run of consecutive failures
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_transition_at: DateTime<Utc>,
}

/// Permit held for the duration of one protected call
///
/// Report the outcome with [`success`](Self::success), [`failure`](Self::failure)
/// or [`ignore`](Self::ignore). Dropping an unreported trial permit frees the
/// trial slot without changing state.
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    /// Whether this permit is the HALF_OPEN trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report the call succeeded
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    /// Report the call failed in a way that counts against the breaker
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }

    /// Report an outcome that says nothing about broker health
    pub fn ignore(mut self) {
        self.settled = true;
        self.breaker.release_trial(self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_trial(self.trial);
        }
    }
}

/// In-process circuit breaker for one broker identity
///
/// # Example
///
/// ```ignore
/// let breaker = CircuitBreaker::new("broker-log", CircuitBreakerConfig::default());
///
/// match breaker.allow() {
///     Ok(permit) => match broker.publish(topic, &msg).await {
///         Ok(_) => permit.success(),
///         Err(e) if e.is_transient() => permit.failure(),
///         Err(_) => permit.ignore(),
///     },
///     Err(open) => return Err(open.into()),
/// }
/// ```
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                last_transition_at: Utc::now(),
            }),
        }
    }

    /// Breaker identity
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Check if a call should be allowed
    ///
    /// Returns a permit that must be used to report the outcome.
    pub fn allow(&self) -> Result<CircuitPermit<'_>, CircuitOpenError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(CircuitPermit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                Err(CircuitOpenError::new(self.name.clone()))
            }
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Current state with counters
    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        self.prune(&mut inner);
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.failures.len() as u32,
            last_transition_at: inner.last_transition_at,
            failure_threshold: self.config.failure_threshold,
            open_duration: self.config.open_duration,
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures.clear(),
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Closed);
            }
            // Late results from calls admitted before the circuit tripped
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                self.prune(&mut inner);
                inner.failures.push_back(Instant::now());
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn release_trial(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }

    /// Move OPEN to HALF_OPEN once the open duration has elapsed
    fn refresh(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|opened_at| opened_at.elapsed())
            .unwrap_or(Duration::ZERO);
        if elapsed >= self.config.open_duration {
            self.transition(inner, CircuitState::HalfOpen);
        }
    }

    /// Drop failures that fell out of the sliding window
    fn prune(&self, inner: &mut BreakerState) {
        let now = Instant::now();
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > self.config.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition_at = Utc::now();

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.failures.clear();
                inner.trial_in_flight = false;
                warn!(
                    breaker = %self.name,
                    %from,
                    open_duration_ms = self.config.open_duration.as_millis() as u64,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                info!(breaker = %self.name, %from, "circuit half-open, allowing trial call");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.failures.clear();
                info!(breaker = %self.name, %from, "circuit closed");
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

/// Named breakers sharing one configuration
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Get the breaker for `name`, creating it closed on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(breaker.value());
        }
        Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
                .value(),
        )
    }

    /// Get an existing breaker
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Snapshots of every breaker, ordered by name
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
