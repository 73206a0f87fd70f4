//! Step execution engine
//!
//! The `ExecutionEngine` is responsible for:
//! - Subscribing to every registered step topic
//! - Running handlers under the step timeout, with panics caught
//! - Driving the execution record through its states
//! - Staging next-step, retry, completion and dead-letter messages in the outbox
//! - Resolving every inbound message context exactly once

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    ExecutionObserver, ExecutionStatus, ExecutionStore, TransitionEvent, WorkflowExecutionRecord,
};
use crate::broker::{
    message_handler, BrokerError, MessageBroker, MessageContext, WorkflowMessage,
    ERROR_CODE_HEADER, ERROR_MESSAGE_HEADER,
};
use crate::outbox::{OutboxKind, OutboxService, StoreError};
use crate::serde_util::duration_millis;
use crate::workflow::{
    CallbackContext, CallbackKind, HandlerError, StepDefinition, StepOutcome, WorkflowRegistry,
};

/// Error code attached to dead-lettered messages
pub const STEP_EXECUTION_FAILED: &str = "STEP_EXECUTION_FAILED";

/// Suffix of the topic that receives completion notices
pub const COMPLETED_SUFFIX: &str = ".completed";

/// Suffix of the topic that receives dead-lettered messages
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Configuration for the execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum handler invocations running at once
    pub max_concurrency: usize,

    /// Stage `<topic>.completed` when a step without a next topic succeeds
    pub publish_completions: bool,

    /// Stage `<topic>.dlq` when a step goes DEAD
    pub publish_dead_letters: bool,

    /// How long `stop` waits for in-flight deliveries
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// How long a delivery arriving after `stop` is held before it is
    /// requeued, so a stopped engine does not spin on redeliveries
    #[serde(with = "duration_millis", default = "default_stopped_requeue_delay")]
    pub stopped_requeue_delay: Duration,
}

fn default_stopped_requeue_delay() -> Duration {
    Duration::from_secs(1)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            publish_completions: true,
            publish_dead_letters: true,
            shutdown_timeout: Duration::from_secs(30),
            stopped_requeue_delay: default_stopped_requeue_delay(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_completions(mut self, enabled: bool) -> Self {
        self.publish_completions = enabled;
        self
    }

    pub fn with_dead_letters(mut self, enabled: bool) -> Self {
        self.publish_dead_letters = enabled;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_stopped_requeue_delay(mut self, delay: Duration) -> Self {
        self.stopped_requeue_delay = delay;
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Outbox or execution store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Broker error while subscribing
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// No step is registered for the topic
    #[error("no step registered for topic: {0}")]
    UnknownTopic(String),

    /// Engine already running
    #[error("execution engine is already running")]
    AlreadyRunning,

    /// In-flight deliveries did not finish in time
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// How the handler invocation ended
enum Invocation {
    Completed(StepOutcome),
    Failed(HandlerError),
    TimedOut(HandlerError),
}

/// How the inbound context gets resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Reject { requeue: bool },
}

/// State shared with broker subscriptions
struct EngineCore {
    registry: Arc<WorkflowRegistry>,
    outbox: OutboxService,
    executions: Arc<dyn ExecutionStore>,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    callbacks: TaskTracker,
    accepting: AtomicBool,
    resumed: Notify,
}

impl EngineCore {
    async fn dispatch(self: Arc<Self>, message: WorkflowMessage, ctx: MessageContext) {
        if !self.accepting.load(Ordering::SeqCst) {
            // Subscriptions outlive stop; hold the delivery so the broker
            // does not hand it straight back
            let _ = tokio::time::timeout(
                self.config.stopped_requeue_delay,
                self.resumed.notified(),
            )
            .await;
            resolve(ctx, Disposition::Reject { requeue: true });
            return;
        }

        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                resolve(ctx, Disposition::Reject { requeue: true });
                return;
            }
        };

        let disposition = self.process(message).await;
        resolve(ctx, disposition);
    }

    #[instrument(skip(self, message), fields(workflow_id = %message.workflow_id, topic = %message.step_topic, attempt = message.attempt()))]
    async fn process(&self, message: WorkflowMessage) -> Disposition {
        let Some(step) = self.registry.get(&message.step_topic).cloned() else {
            warn!("no step registered for topic, discarding message");
            return Disposition::Reject { requeue: false };
        };

        let attempt = message.attempt();
        let mut record = self.load_record(&message).await;

        if record.status.is_terminal() {
            debug!(status = %record.status, "step already finished, acknowledging duplicate");
            return Disposition::Ack;
        }

        // A retry for a later attempt is already staged or running
        if attempt < record.attempt {
            debug!(
                current_attempt = record.attempt,
                status = %record.status,
                "attempt superseded, acknowledging duplicate"
            );
            return Disposition::Ack;
        }

        self.transition(&mut record, ExecutionStatus::InProgress, |r| {
            r.attempt = attempt;
            r.started_at = Some(Utc::now());
            r.completed_at = None;
        })
        .await;

        if attempt > step.max_attempts() {
            let error = HandlerError::non_retryable(format!(
                "attempt {} exceeds the budget of {}",
                attempt,
                step.max_attempts()
            ));
            return self.give_up(&step, &message, &mut record, error, false).await;
        }

        match self.invoke(&step, message.clone()).await {
            Invocation::Completed(StepOutcome::Ignore) => {
                debug!("handler ignored message");
                self.transition(&mut record, ExecutionStatus::Succeeded, |r| {
                    r.completed_at = Some(Utc::now());
                })
                .await;
                Disposition::Ack
            }
            Invocation::Completed(StepOutcome::Success(output)) => {
                self.succeed(&step, &message, &mut record, output).await
            }
            Invocation::Failed(error) => self.fail(&step, &message, &mut record, error, false).await,
            Invocation::TimedOut(error) => self.fail(&step, &message, &mut record, error, true).await,
        }
    }

    /// Run the handler, converting panics and timeouts into handler errors
    async fn invoke(&self, step: &StepDefinition, message: WorkflowMessage) -> Invocation {
        let call = AssertUnwindSafe(step.handler().handle(message)).catch_unwind();

        let result = match step.timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => return Invocation::TimedOut(HandlerError::timed_out(timeout)),
            },
            None => call.await,
        };

        match result {
            Ok(Ok(outcome)) => Invocation::Completed(outcome),
            Ok(Err(error)) => Invocation::Failed(error),
            Err(panic) => Invocation::Failed(HandlerError::panicked(panic.as_ref())),
        }
    }

    async fn succeed(
        &self,
        step: &Arc<StepDefinition>,
        message: &WorkflowMessage,
        record: &mut WorkflowExecutionRecord,
        output: Option<Value>,
    ) -> Disposition {
        let payload = output.clone().unwrap_or_else(|| message.payload.clone());

        let staged = match step.next_topic() {
            Some(next) => self
                .stage(&message.derive(next, payload), OutboxKind::Workflow, None)
                .await,
            None if self.config.publish_completions => {
                let topic = format!("{}{}", step.topic(), COMPLETED_SUFFIX);
                self.stage(&message.derive(topic, payload), OutboxKind::Completion, None)
                    .await
            }
            None => Ok(()),
        };
        if let Err(e) = staged {
            return self.staging_failed(record, e).await;
        }

        self.transition(record, ExecutionStatus::Succeeded, |r| {
            r.completed_at = Some(Utc::now());
            r.error = None;
        })
        .await;
        info!(next_topic = ?step.next_topic(), "step succeeded");

        self.fire_callback(step.on_success(), || CallbackContext {
            kind: CallbackKind::Success,
            workflow_id: message.workflow_id,
            topic: step.topic().to_string(),
            attempt: record.attempt,
            message: message.clone(),
            output,
            error: None,
        });

        Disposition::Ack
    }

    async fn fail(
        &self,
        step: &Arc<StepDefinition>,
        message: &WorkflowMessage,
        record: &mut WorkflowExecutionRecord,
        error: HandlerError,
        timed_out: bool,
    ) -> Disposition {
        let attempt = message.attempt();

        if !step.is_retryable(&error) || attempt >= step.max_attempts() {
            return self.give_up(step, message, record, error, timed_out).await;
        }

        let next_attempt = attempt + 1;
        let delay = step.backoff().delay_for_retry(attempt);
        let not_before = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        if let Err(e) = self
            .stage(&message.for_attempt(next_attempt), OutboxKind::Retry, Some(not_before))
            .await
        {
            return self.staging_failed(record, e).await;
        }

        warn!(
            error = %error,
            next_attempt,
            delay_ms = delay.as_millis() as u64,
            "step failed, retry scheduled"
        );
        self.transition(record, ExecutionStatus::RetryScheduled, |r| {
            r.attempt = next_attempt;
            r.error = Some(error.to_string());
        })
        .await;

        failure_disposition(timed_out)
    }

    async fn give_up(
        &self,
        step: &Arc<StepDefinition>,
        message: &WorkflowMessage,
        record: &mut WorkflowExecutionRecord,
        error: HandlerError,
        timed_out: bool,
    ) -> Disposition {
        if self.config.publish_dead_letters {
            let topic = format!("{}{}", step.topic(), DEAD_LETTER_SUFFIX);
            let dead_letter = message
                .derive(topic, message.payload.clone())
                .with_header(ERROR_CODE_HEADER, STEP_EXECUTION_FAILED)
                .with_header(ERROR_MESSAGE_HEADER, error.to_string());
            if let Err(e) = self.stage(&dead_letter, OutboxKind::DeadLetter, None).await {
                return self.staging_failed(record, e).await;
            }
        }

        error!(error = %error, "step is dead");
        self.transition(record, ExecutionStatus::Dead, |r| {
            r.completed_at = Some(Utc::now());
            r.error = Some(error.to_string());
        })
        .await;

        self.fire_callback(step.on_failure(), || CallbackContext {
            kind: CallbackKind::Failure,
            workflow_id: message.workflow_id,
            topic: step.topic().to_string(),
            attempt: record.attempt,
            message: message.clone(),
            output: None,
            error: Some(error.clone()),
        });

        failure_disposition(timed_out)
    }

    /// The outcome could not be persisted: requeue so the step runs again
    async fn staging_failed(
        &self,
        record: &mut WorkflowExecutionRecord,
        e: StoreError,
    ) -> Disposition {
        error!("Failed to stage outbox message: {}", e);
        self.transition(record, ExecutionStatus::Failed, |r| {
            r.error = Some(e.to_string());
        })
        .await;
        Disposition::Reject { requeue: true }
    }

    async fn stage(
        &self,
        message: &WorkflowMessage,
        kind: OutboxKind,
        not_before: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.outbox.stage(message, kind, not_before).await.map(|_| ())
    }

    async fn load_record(&self, message: &WorkflowMessage) -> WorkflowExecutionRecord {
        match self
            .executions
            .get(message.workflow_id, &message.step_topic)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => self.create_record(message.workflow_id, &message.step_topic).await,
            Err(e) => {
                error!("Failed to load execution record: {}", e);
                WorkflowExecutionRecord::pending(message.workflow_id, &message.step_topic)
            }
        }
    }

    /// Create the PENDING record of a step, or load the one that won the race
    async fn create_record(&self, workflow_id: Uuid, topic: &str) -> WorkflowExecutionRecord {
        let record = WorkflowExecutionRecord::pending(workflow_id, topic);
        match self.executions.insert_if_absent(&record).await {
            Ok(true) => {}
            Ok(false) => {
                if let Ok(Some(existing)) = self.executions.get(workflow_id, topic).await {
                    return existing;
                }
            }
            Err(e) => error!("Failed to create execution record: {}", e),
        }
        self.notify(None, &record);
        record
    }

    async fn transition<F>(&self, record: &mut WorkflowExecutionRecord, to: ExecutionStatus, f: F)
    where
        F: FnOnce(&mut WorkflowExecutionRecord),
    {
        let from = record.status;
        record.status = to;
        f(record);
        record.updated_at = Utc::now();

        self.persist(record).await;
        self.notify(Some(from), record);
    }

    async fn persist(&self, record: &WorkflowExecutionRecord) {
        if let Err(e) = self.executions.upsert(record).await {
            error!(status = %record.status, "Failed to persist execution record: {}", e);
        }
    }

    fn notify(&self, from: Option<ExecutionStatus>, record: &WorkflowExecutionRecord) {
        if self.observers.is_empty() {
            return;
        }

        let event = TransitionEvent {
            workflow_id: record.workflow_id,
            topic: record.topic.clone(),
            from,
            to: record.status,
            attempt: record.attempt,
            error: record.error.clone(),
            at: record.updated_at,
        };
        for observer in &self.observers {
            observer.on_transition(&event);
        }
    }

    fn fire_callback<F>(&self, name: Option<&str>, ctx: F)
    where
        F: FnOnce() -> CallbackContext,
    {
        let Some(name) = name else {
            return;
        };
        let Some(callback) = self.registry.callback(name).cloned() else {
            return;
        };

        let ctx = ctx();
        let name = name.to_string();
        self.callbacks.spawn(async move {
            let topic = ctx.topic.clone();
            match AssertUnwindSafe(callback.call(ctx)).catch_unwind().await {
                Ok(Ok(())) => debug!(callback = %name, %topic, "callback completed"),
                Ok(Err(e)) => warn!(callback = %name, %topic, error = %e, "callback failed"),
                Err(_) => error!(callback = %name, %topic, "callback panicked"),
            }
        });
    }
}

fn failure_disposition(timed_out: bool) -> Disposition {
    // Retries are driven by the outbox, never by broker redelivery
    if timed_out {
        Disposition::Reject { requeue: false }
    } else {
        Disposition::Ack
    }
}

fn resolve(ctx: MessageContext, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack => ctx.acknowledge(),
        Disposition::Reject { requeue } => ctx.reject(requeue),
    };
    if let Err(e) = result {
        error!(?disposition, "Failed to resolve message context: {}", e);
    }
}

/// Consumes step messages and drives them through their handlers
///
/// # Example
///
/// ```ignore
/// use stepflow::prelude::*;
///
/// let engine = ExecutionEngine::new(registry, outbox, executions, EngineConfig::default());
/// engine.start(broker.as_ref()).await?;
///
/// let workflow_id = engine.start_workflow("orders.charge", json!({"order": 42})).await?;
///
/// // ... later
/// engine.stop().await?;
/// ```
pub struct ExecutionEngine {
    core: Arc<EngineCore>,
    running: AtomicBool,
}

impl ExecutionEngine {
    /// Create a new engine
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        outbox: OutboxService,
        executions: Arc<dyn ExecutionStore>,
        config: EngineConfig,
    ) -> Self {
        Self::with_observers(registry, outbox, executions, config, Vec::new())
    }

    /// Create a new engine notifying `observers` of every record transition
    pub fn with_observers(
        registry: Arc<WorkflowRegistry>,
        outbox: OutboxService,
        executions: Arc<dyn ExecutionStore>,
        config: EngineConfig,
        observers: Vec<Arc<dyn ExecutionObserver>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));

        Self {
            core: Arc::new(EngineCore {
                registry,
                outbox,
                executions,
                observers,
                config,
                permits,
                callbacks: TaskTracker::new(),
                accepting: AtomicBool::new(true),
                resumed: Notify::new(),
            }),
            running: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.core.registry
    }

    pub fn executions(&self) -> &Arc<dyn ExecutionStore> {
        &self.core.executions
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to every registered step topic
    #[instrument(skip(self, broker), fields(broker = %broker.broker_type()))]
    pub async fn start(&self, broker: &dyn MessageBroker) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        self.core.accepting.store(true, Ordering::SeqCst);
        self.core.resumed.notify_waiters();

        let topics = self.core.registry.topics();
        for topic in &topics {
            let core = Arc::clone(&self.core);
            let handler = message_handler(move |message, ctx| Arc::clone(&core).dispatch(message, ctx));
            if let Err(e) = broker.subscribe(topic, handler).await {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        info!(
            topics = ?topics,
            max_concurrency = self.core.config.max_concurrency,
            "Execution engine started"
        );
        Ok(())
    }

    /// Stop accepting deliveries and wait for in-flight work
    ///
    /// Messages arriving after this call are held for the stopped requeue
    /// delay, then rejected with requeue. Closing the broker is left to the
    /// caller.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), EngineError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.core.accepting.store(false, Ordering::SeqCst);

        let max = self.core.config.max_concurrency.max(1) as u32;
        let drained = tokio::time::timeout(self.core.config.shutdown_timeout, async {
            // Holding every permit means no delivery is in flight
            let _all = self.core.permits.acquire_many(max).await;
            self.core.callbacks.close();
            self.core.callbacks.wait().await;
        })
        .await;
        self.core.callbacks.reopen();

        match drained {
            Ok(()) => {
                info!("Execution engine stopped");
                Ok(())
            }
            Err(_) => {
                warn!("Shutdown timeout reached");
                Err(EngineError::ShutdownTimeout)
            }
        }
    }

    /// Start a new workflow instance at `topic`
    ///
    /// Stages the first step message in the outbox and returns the new
    /// workflow id. The step must be registered with this engine. No
    /// execution record is created unless the message was staged.
    #[instrument(skip(self, payload))]
    pub async fn start_workflow(&self, topic: &str, payload: Value) -> Result<Uuid, EngineError> {
        if !self.core.registry.contains(topic) {
            return Err(EngineError::UnknownTopic(topic.to_string()));
        }

        let workflow_id = Uuid::now_v7();
        let message = WorkflowMessage::new(workflow_id, topic, payload);

        self.core
            .outbox
            .stage(&message, OutboxKind::Workflow, None)
            .await?;
        self.core.create_record(workflow_id, topic).await;

        info!(%workflow_id, "workflow started");
        Ok(workflow_id)
    }

    /// Process one delivery directly, bypassing broker subscriptions
    ///
    /// Resolves `ctx` exactly once.
    pub async fn handle_delivery(&self, message: WorkflowMessage, ctx: MessageContext) {
        Arc::clone(&self.core).dispatch(message, ctx).await;
    }

    /// Load the execution record of one step
    pub async fn execution(
        &self,
        workflow_id: Uuid,
        topic: &str,
    ) -> Result<Option<WorkflowExecutionRecord>, EngineError> {
        Ok(self.core.executions.get(workflow_id, topic).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    use super::*;
    use crate::broker::{
        BrokerConfig, ChannelAcknowledger, DeliveryMetadata, InMemoryLogBroker, Resolution,
        ATTEMPT_HEADER,
    };
    use crate::engine::InMemoryExecutionStore;
    use crate::outbox::{InMemoryOutboxStore, OutboxMessage, OutboxStore};
    use crate::reliability::BackoffPolicy;
    use crate::workflow::{callback_fn, handler_fn, StepBuilder, StepDefaults};

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<TransitionEvent>>,
    }

    impl RecordingObserver {
        fn statuses(&self) -> Vec<ExecutionStatus> {
            let events = self.events.lock();
            let mut statuses: Vec<_> = events
                .first()
                .and_then(|e| e.from)
                .into_iter()
                .collect();
            statuses.extend(events.iter().map(|e| e.to));
            statuses
        }
    }

    impl ExecutionObserver for RecordingObserver {
        fn on_transition(&self, event: &TransitionEvent) {
            self.events.lock().push(event.clone());
        }
    }

    struct TestHarness {
        engine: ExecutionEngine,
        outbox: Arc<InMemoryOutboxStore>,
        observer: Arc<RecordingObserver>,
    }

    impl TestHarness {
        fn new(steps: Vec<StepBuilder>) -> Self {
            Self::with_registry(steps, |b| b)
        }

        fn with_registry<F>(steps: Vec<StepBuilder>, f: F) -> Self
        where
            F: FnOnce(crate::workflow::WorkflowRegistryBuilder) -> crate::workflow::WorkflowRegistryBuilder,
        {
            let mut builder = WorkflowRegistry::builder().with_defaults(
                StepDefaults::default()
                    .with_max_retries(2)
                    .with_backoff(BackoffPolicy::fixed(Duration::ZERO)),
            );
            for step in steps {
                builder = builder.step(step);
            }
            let registry = Arc::new(f(builder).build().unwrap());

            let outbox = Arc::new(InMemoryOutboxStore::new());
            let observer = Arc::new(RecordingObserver::default());
            let engine = ExecutionEngine::with_observers(
                registry,
                OutboxService::new(outbox.clone(), 5),
                Arc::new(InMemoryExecutionStore::new()),
                EngineConfig::default(),
                vec![observer.clone()],
            );

            Self {
                engine,
                outbox,
                observer,
            }
        }

        async fn deliver(&self, message: WorkflowMessage) -> Resolution {
            let (ack, rx): (ChannelAcknowledger, oneshot::Receiver<Resolution>) =
                ChannelAcknowledger::new();
            let ctx = MessageContext::new(
                message.step_topic.clone(),
                DeliveryMetadata::Queue {
                    delivery_tag: 1,
                    redelivered: false,
                },
                ack,
            );
            self.engine.handle_delivery(message, ctx).await;
            rx.await.unwrap()
        }

        fn staged(&self, topic: &str) -> Vec<OutboxMessage> {
            self.outbox
                .all()
                .into_iter()
                .filter(|r| r.destination_topic == topic)
                .collect()
        }
    }

    fn message(topic: &str) -> WorkflowMessage {
        WorkflowMessage::new(Uuid::now_v7(), topic, serde_json::json!({"order": 42}))
    }

    #[tokio::test]
    async fn test_success_stages_next_step_and_acks() {
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.charge",
            handler_fn(|msg| async move {
                Ok(StepOutcome::success_with(serde_json::json!({
                    "order": msg.payload["order"],
                    "charged": true,
                })))
            }),
        )
        .next("orders.ship")]);

        let msg = message("orders.charge");
        assert_eq!(harness.deliver(msg.clone()).await, Resolution::Acknowledged);

        let staged = harness.staged("orders.ship");
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].kind, OutboxKind::Workflow);
        assert_eq!(staged[0].workflow_id, msg.workflow_id);
        assert_eq!(staged[0].payload["charged"], true);
        assert_eq!(staged[0].headers.get(ATTEMPT_HEADER).map(String::as_str), Some("1"));

        let record = harness
            .engine
            .execution(msg.workflow_id, "orders.charge")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        assert!(record.completed_at.is_some());
        assert_eq!(
            harness.observer.statuses(),
            vec![
                ExecutionStatus::Pending,
                ExecutionStatus::InProgress,
                ExecutionStatus::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_last_step_stages_completion() {
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.ship",
            handler_fn(|_| async { Ok(StepOutcome::success()) }),
        )]);

        harness.deliver(message("orders.ship")).await;

        let completed = harness.staged("orders.ship.completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].kind, OutboxKind::Completion);
        assert_eq!(completed[0].payload, serde_json::json!({"order": 42}));
    }

    #[tokio::test]
    async fn test_always_failing_step_goes_dead_after_all_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.charge",
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(HandlerError::retryable("card processor unavailable")) }
            }),
        )]);

        let mut msg = message("orders.charge");
        for attempt in 1..=3 {
            assert_eq!(msg.attempt(), attempt);
            assert_eq!(harness.deliver(msg.clone()).await, Resolution::Acknowledged);
            if attempt < 3 {
                let retry = harness
                    .staged("orders.charge")
                    .into_iter()
                    .find(|r| r.headers.get(ATTEMPT_HEADER) == Some(&(attempt + 1).to_string()))
                    .unwrap();
                assert_eq!(retry.kind, OutboxKind::Retry);
                msg = retry.to_workflow_message();
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            harness.observer.statuses(),
            vec![
                ExecutionStatus::Pending,
                ExecutionStatus::InProgress,
                ExecutionStatus::RetryScheduled,
                ExecutionStatus::InProgress,
                ExecutionStatus::RetryScheduled,
                ExecutionStatus::InProgress,
                ExecutionStatus::Dead,
            ]
        );

        let record = harness
            .engine
            .execution(msg.workflow_id, "orders.charge")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Dead);
        assert_eq!(record.attempt, 3);
        assert_eq!(record.error.as_deref(), Some("card processor unavailable"));

        let dlq = harness.staged("orders.charge.dlq");
        assert_eq!(dlq.len(), 1);
        assert_eq!(
            dlq[0].headers.get(ERROR_CODE_HEADER).map(String::as_str),
            Some(STEP_EXECUTION_FAILED)
        );
        assert_eq!(
            dlq[0].headers.get(ERROR_MESSAGE_HEADER).map(String::as_str),
            Some("card processor unavailable")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_schedules_retry_and_rejects() {
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.slow",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(StepOutcome::success())
            }),
        )
        .timeout(Duration::from_millis(100))]);

        let msg = message("orders.slow");
        assert_eq!(
            harness.deliver(msg.clone()).await,
            Resolution::Rejected { requeue: false }
        );

        let record = harness
            .engine
            .execution(msg.workflow_id, "orders.slow")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::RetryScheduled);
        assert_eq!(record.attempt, 2);
        assert!(record.error.unwrap().contains("timed out"));

        let events = harness.observer.events.lock().clone();
        let last = events.last().unwrap();
        assert_eq!(last.from, Some(ExecutionStatus::InProgress));
        assert_eq!(last.to, ExecutionStatus::RetryScheduled);

        let retries = harness.staged("orders.slow");
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].to_workflow_message().attempt(), 2);
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.buggy",
            handler_fn(|msg| async move {
                if msg.attempt() > 0 {
                    panic!("index out of bounds");
                }
                Ok(StepOutcome::success())
            }),
        )
        .max_retries(0)]);

        let msg = message("orders.buggy");
        assert_eq!(harness.deliver(msg.clone()).await, Resolution::Acknowledged);

        let record = harness
            .engine
            .execution(msg.workflow_id, "orders.buggy")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Dead);
        assert!(record.error.unwrap().contains("index out of bounds"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_skips_retries() {
        let harness = TestHarness::new(vec![
            StepDefinition::builder(
                "orders.charge",
                handler_fn(|_| async {
                    Err(HandlerError::retryable("declined").with_type("CARD_DECLINED"))
                }),
            )
            .non_retryable(["CARD_DECLINED"]),
        ]);

        let msg = message("orders.charge");
        harness.deliver(msg.clone()).await;

        let record = harness
            .engine
            .execution(msg.workflow_id, "orders.charge")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Dead);
        assert_eq!(record.attempt, 1);
        assert!(harness.staged("orders.charge").is_empty());
    }

    #[tokio::test]
    async fn test_ignore_acks_without_staging() {
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.audit",
            handler_fn(|_| async { Ok(StepOutcome::Ignore) }),
        )
        .next("orders.archive")]);

        let msg = message("orders.audit");
        assert_eq!(harness.deliver(msg.clone()).await, Resolution::Acknowledged);
        assert!(harness.outbox.is_empty());
        assert_eq!(
            harness
                .engine
                .execution(msg.workflow_id, "orders.audit")
                .await
                .unwrap()
                .unwrap()
                .status,
            ExecutionStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_unknown_topic_is_discarded() {
        let harness = TestHarness::new(vec![]);
        assert_eq!(
            harness.deliver(message("orders.unknown")).await,
            Resolution::Rejected { requeue: false }
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_after_success_is_acked() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.ship",
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(StepOutcome::success()) }
            }),
        )]);

        let msg = message("orders.ship");
        harness.deliver(msg.clone()).await;
        assert_eq!(harness.deliver(msg).await, Resolution::Acknowledged);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callbacks_fire_and_failures_are_contained() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let harness = TestHarness::with_registry(
            vec![
                StepDefinition::builder("a", handler_fn(|_| async { Ok(StepOutcome::success()) }))
                    .on_success("record"),
                StepDefinition::builder(
                    "b",
                    handler_fn(|_| async { Err(HandlerError::non_retryable("nope")) }),
                )
                .on_failure("explode"),
            ],
            move |b| {
                b.callback(
                    "record",
                    callback_fn(move |ctx| {
                        let sink = sink.clone();
                        async move {
                            sink.lock().push((ctx.kind, ctx.topic));
                            Ok(())
                        }
                    }),
                )
                .callback(
                    "explode",
                    callback_fn(|_| async { Err(HandlerError::retryable("callback down")) }),
                )
            },
        );

        assert_eq!(harness.deliver(message("a")).await, Resolution::Acknowledged);
        assert_eq!(harness.deliver(message("b")).await, Resolution::Acknowledged);

        harness.engine.core.callbacks.close();
        harness.engine.core.callbacks.wait().await;
        assert_eq!(*seen.lock(), vec![(CallbackKind::Success, "a".to_string())]);
    }

    /// Outbox whose every insert fails
    struct BrokenOutbox;

    #[async_trait::async_trait]
    impl OutboxStore for BrokenOutbox {
        async fn insert(&self, _m: &OutboxMessage) -> Result<(), StoreError> {
            Err(StoreError::Database("connection lost".into()))
        }
        async fn get(&self, _id: Uuid) -> Result<Option<OutboxMessage>, StoreError> {
            Ok(None)
        }
        async fn claim_batch(
            &self,
            _c: &str,
            _l: usize,
            _d: Duration,
        ) -> Result<Vec<OutboxMessage>, StoreError> {
            Ok(vec![])
        }
        async fn mark_sent(
            &self,
            _id: Uuid,
            _c: &str,
            _t: chrono::DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn record_failure(
            &self,
            _id: Uuid,
            _c: &str,
            _u: &crate::outbox::AttemptUpdate,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn release(
            &self,
            _id: Uuid,
            _c: &str,
            _t: chrono::DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn counts(&self) -> Result<crate::outbox::OutboxCounts, StoreError> {
            Ok(Default::default())
        }
        async fn delete_sent_before(
            &self,
            _t: chrono::DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn create_broken_engine(executions: Arc<InMemoryExecutionStore>) -> ExecutionEngine {
        let registry = Arc::new(
            WorkflowRegistry::builder()
                .step(StepDefinition::builder(
                    "orders.charge",
                    handler_fn(|_| async { Ok(StepOutcome::success()) }),
                ))
                .build()
                .unwrap(),
        );
        ExecutionEngine::new(
            registry,
            OutboxService::new(Arc::new(BrokenOutbox), 5),
            executions,
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_staging_failure_requeues() {
        let executions = Arc::new(InMemoryExecutionStore::new());
        let engine = create_broken_engine(executions.clone());

        let msg = message("orders.charge");
        let (ack, rx) = ChannelAcknowledger::new();
        let ctx = MessageContext::new(
            "orders.charge",
            DeliveryMetadata::Log {
                partition: 0,
                offset: 0,
            },
            ack,
        );
        engine.handle_delivery(msg.clone(), ctx).await;

        assert_eq!(rx.await.unwrap(), Resolution::Rejected { requeue: true });
        let record = executions.get(msg.workflow_id, "orders.charge").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_start_workflow_staging_failure_leaves_no_record() {
        let executions = Arc::new(InMemoryExecutionStore::new());
        let engine = create_broken_engine(executions.clone());

        let result = engine
            .start_workflow("orders.charge", serde_json::json!({"order": 1}))
            .await;
        assert!(matches!(tokio_test::assert_err!(result), EngineError::Store(_)));
        assert!(executions.is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_attempt_does_not_fork_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.charge",
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(HandlerError::retryable("card processor unavailable")) }
            }),
        )]);
        let staged_attempt = |attempt: u32| {
            harness
                .staged("orders.charge")
                .into_iter()
                .find(|r| r.headers.get(ATTEMPT_HEADER) == Some(&attempt.to_string()))
                .map(|r| r.to_workflow_message())
        };

        let first = message("orders.charge");
        assert_eq!(harness.deliver(first.clone()).await, Resolution::Acknowledged);
        assert_eq!(harness.deliver(first.clone()).await, Resolution::Acknowledged);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.staged("orders.charge").len(), 1);

        let second = staged_attempt(2).unwrap();
        harness.deliver(second.clone()).await;
        harness.deliver(second).await;
        harness.deliver(first.clone()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(harness.staged("orders.charge").len(), 2);

        let third = staged_attempt(3).unwrap();
        harness.deliver(third.clone()).await;
        harness.deliver(third).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(harness.staged("orders.charge").len(), 2);
        assert_eq!(harness.staged("orders.charge.dlq").len(), 1);
        let record = harness
            .engine
            .execution(first.workflow_id, "orders.charge")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Dead);
        assert_eq!(record.attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_engine_holds_deliveries_before_requeue() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.charge",
            handler_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(StepOutcome::success()) }
            }),
        )]);
        let broker = InMemoryLogBroker::new(BrokerConfig::default());
        harness.engine.start(&broker).await.unwrap();
        harness.engine.stop().await.unwrap();

        let held_since = tokio::time::Instant::now();
        assert_eq!(
            harness.deliver(message("orders.charge")).await,
            Resolution::Rejected { requeue: true }
        );
        assert!(held_since.elapsed() >= EngineConfig::default().stopped_requeue_delay);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(harness.outbox.is_empty());

        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_workflow_stages_first_step() {
        let harness = TestHarness::new(vec![StepDefinition::builder(
            "orders.charge",
            handler_fn(|_| async { Ok(StepOutcome::success()) }),
        )]);

        let workflow_id = harness
            .engine
            .start_workflow("orders.charge", serde_json::json!({"order": 1}))
            .await
            .unwrap();

        let staged = harness.staged("orders.charge");
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].workflow_id, workflow_id);
        assert_eq!(
            harness
                .engine
                .execution(workflow_id, "orders.charge")
                .await
                .unwrap()
                .unwrap()
                .status,
            ExecutionStatus::Pending
        );

        assert!(matches!(
            harness.engine.start_workflow("orders.nope", Value::Null).await,
            Err(EngineError::UnknownTopic(_))
        ));
    }
}
