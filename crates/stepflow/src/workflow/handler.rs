//! Step handler and callback capabilities

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::broker::WorkflowMessage;

/// Error type for step failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    ///
    /// Matched against a step's `non_retryable_errors`.
    pub error_type: Option<String>,

    /// Whether another attempt may succeed
    ///
    /// Non-retryable errors send the step straight to DEAD.
    pub retryable: bool,
}

impl HandlerError {
    /// Error type recorded when a handler exceeds its timeout
    pub const TIMEOUT: &'static str = "TIMEOUT";

    /// Error type recorded when a handler panics
    pub const PANIC: &'static str = "PANIC";

    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub(crate) fn timed_out(timeout: Duration) -> Self {
        Self::retryable(format!("step timed out after {}ms", timeout.as_millis()))
            .with_type(Self::TIMEOUT)
    }

    pub(crate) fn panicked(panic: &(dyn std::any::Any + Send)) -> Self {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::retryable(format!("handler panicked: {}", detail)).with_type(Self::PANIC)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(t) => write!(f, "{}: {}", t, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Successful result of a step handler
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step done; the optional value replaces the payload passed downstream
    Success(Option<Value>),

    /// Message is not relevant to this step; acknowledge and move on
    Ignore,
}

impl StepOutcome {
    /// Success forwarding the inbound payload
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success forwarding `output` to the next step
    pub fn success_with(output: Value) -> Self {
        Self::Success(Some(output))
    }
}

/// Business logic bound to one step topic
///
/// Handlers may be invoked more than once for the same workflow and topic
/// (retries, broker redelivery). The `x-attempt` header on the message lets
/// a handler detect repeats.
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    /// Process one message
    async fn handle(&self, message: WorkflowMessage) -> Result<StepOutcome, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(WorkflowMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: WorkflowMessage) -> Result<StepOutcome, HandlerError> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a [`StepHandler`]
///
/// # Example
///
/// ```
/// use stepflow::workflow::{handler_fn, StepOutcome};
///
/// let handler = handler_fn(|msg| async move {
///     let amount = msg.payload["amount"].as_u64().unwrap_or(0);
///     Ok(StepOutcome::success_with(serde_json::json!({ "charged": amount })))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(WorkflowMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Terminal outcome reported to a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    Success,
    Failure,
}

/// What a success or failure callback gets to see
#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub kind: CallbackKind,
    pub workflow_id: Uuid,
    pub topic: String,
    pub attempt: u32,
    /// The inbound message that triggered the step
    pub message: WorkflowMessage,
    /// Handler output (success only)
    pub output: Option<Value>,
    /// Last error (failure only)
    pub error: Option<HandlerError>,
}

/// Fire-and-forget hook run after a step succeeds or dies
///
/// Errors are logged and never affect the workflow.
#[async_trait]
pub trait StepCallback: Send + Sync + 'static {
    async fn call(&self, ctx: CallbackContext) -> Result<(), HandlerError>;
}

struct FnCallback<F>(F);

#[async_trait]
impl<F, Fut> StepCallback for FnCallback<F>
where
    F: Fn(CallbackContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn call(&self, ctx: CallbackContext) -> Result<(), HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`StepCallback`]
pub fn callback_fn<F, Fut>(f: F) -> Arc<dyn StepCallback>
where
    F: Fn(CallbackContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnCallback(f))
}
