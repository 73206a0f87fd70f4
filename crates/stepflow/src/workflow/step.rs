//! Step definitions

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{HandlerError, StepHandler};
use crate::reliability::BackoffPolicy;
use crate::serde_util::duration_millis;

/// Defaults applied to steps that do not set their own policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefaults {
    /// Handler timeout (zero disables it)
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay schedule between attempts
    pub backoff: BackoffPolicy,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 3,
            backoff: BackoffPolicy::exponential(),
        }
    }
}

impl StepDefaults {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Immutable definition of one workflow step
///
/// Built through [`StepDefinition::builder`] and owned by the registry.
#[derive(Clone)]
pub struct StepDefinition {
    topic: String,
    handler: Arc<dyn StepHandler>,
    timeout: Duration,
    max_retries: u32,
    backoff: BackoffPolicy,
    on_success: Option<String>,
    on_failure: Option<String>,
    next_topic: Option<String>,
    non_retryable_errors: Vec<String>,
}

impl StepDefinition {
    /// Start declaring a step bound to `topic`
    pub fn builder(topic: impl Into<String>, handler: Arc<dyn StepHandler>) -> StepBuilder {
        StepBuilder {
            topic: topic.into(),
            handler,
            timeout: None,
            max_retries: None,
            backoff: None,
            on_success: None,
            on_failure: None,
            next_topic: None,
            non_retryable_errors: Vec::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn handler(&self) -> &Arc<dyn StepHandler> {
        &self.handler
    }

    /// Handler timeout, `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total dispatch attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn on_success(&self) -> Option<&str> {
        self.on_success.as_deref()
    }

    pub fn on_failure(&self) -> Option<&str> {
        self.on_failure.as_deref()
    }

    pub fn next_topic(&self) -> Option<&str> {
        self.next_topic.as_deref()
    }

    /// Whether `error` may be retried under this step's policy
    pub fn is_retryable(&self, error: &HandlerError) -> bool {
        error.retryable
            && !error
                .error_type
                .as_ref()
                .is_some_and(|t| self.non_retryable_errors.iter().any(|n| n == t))
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("topic", &self.topic)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("on_success", &self.on_success)
            .field("on_failure", &self.on_failure)
            .field("next_topic", &self.next_topic)
            .field("non_retryable_errors", &self.non_retryable_errors)
            .finish_non_exhaustive()
    }
}

/// Declaration of a step, resolved against registry defaults at build time
pub struct StepBuilder {
    pub(crate) topic: String,
    handler: Arc<dyn StepHandler>,
    timeout: Option<Duration>,
    max_retries: Option<u32>,
    backoff: Option<BackoffPolicy>,
    pub(crate) on_success: Option<String>,
    pub(crate) on_failure: Option<String>,
    next_topic: Option<String>,
    non_retryable_errors: Vec<String>,
}

impl StepBuilder {
    /// Set the handler timeout (zero disables it)
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how many times a failed attempt is retried
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the retry backoff
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Name of the callback run after success
    pub fn on_success(mut self, callback: impl Into<String>) -> Self {
        self.on_success = Some(callback.into());
        self
    }

    /// Name of the callback run after the step goes DEAD
    pub fn on_failure(mut self, callback: impl Into<String>) -> Self {
        self.on_failure = Some(callback.into());
        self
    }

    /// Topic of the step that follows this one
    pub fn next(mut self, topic: impl Into<String>) -> Self {
        self.next_topic = Some(topic.into());
        self
    }

    /// Error types that are never retried
    pub fn non_retryable<I, S>(mut self, error_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.non_retryable_errors
            .extend(error_types.into_iter().map(Into::into));
        self
    }

    pub(crate) fn build(self, defaults: &StepDefaults) -> StepDefinition {
        StepDefinition {
            topic: self.topic,
            handler: self.handler,
            timeout: self.timeout.unwrap_or(defaults.timeout),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            backoff: self.backoff.unwrap_or_else(|| defaults.backoff.clone()),
            on_success: self.on_success,
            on_failure: self.on_failure,
            next_topic: self.next_topic,
            non_retryable_errors: self.non_retryable_errors,
        }
    }
}
