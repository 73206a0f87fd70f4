//! End-to-end tests wiring registry, engine, outbox relay and broker together
//!
//! Run with: cargo test -p stepflow --test end_to_end_test

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use stepflow::broker::{
    message_handler, BrokerConfig, BrokerKind, InMemoryLogBroker, InMemoryQueueBroker,
    MessageBroker, WorkflowMessage,
};
use stepflow::engine::{
    EngineConfig, ExecutionEngine, ExecutionStatus, InMemoryExecutionStore, COMPLETED_SUFFIX,
};
use stepflow::health::{HealthMonitor, HealthStatus};
use stepflow::outbox::{InMemoryOutboxStore, OutboxRelay, OutboxService, OutboxStore, RelayConfig};
use stepflow::reliability::{
    BackoffPolicy, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, ResilientBroker,
};
use stepflow::workflow::{handler_fn, HandlerError, StepDefinition, StepOutcome, WorkflowRegistry};

const CHARGE: &str = "orders.charge";
const SHIP: &str = "orders.ship";

struct Pipeline {
    engine: ExecutionEngine,
    relay: OutboxRelay,
    store: Arc<InMemoryOutboxStore>,
    broker: Arc<dyn MessageBroker>,
    breakers: Arc<CircuitBreakerRegistry>,
    completions: mpsc::UnboundedReceiver<WorkflowMessage>,
}

impl Pipeline {
    async fn start(
        registry: WorkflowRegistry,
        delegate: Arc<dyn MessageBroker>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(breaker_config));
        let broker: Arc<dyn MessageBroker> = Arc::new(ResilientBroker::new(delegate, &breakers));
        let store = Arc::new(InMemoryOutboxStore::new());

        let (tx, completions) = mpsc::unbounded_channel();
        broker
            .subscribe(
                &format!("{}{}", SHIP, COMPLETED_SUFFIX),
                message_handler(move |message, ctx| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(message);
                        let _ = ctx.acknowledge();
                    }
                }),
            )
            .await
            .unwrap();

        let engine = ExecutionEngine::new(
            Arc::new(registry),
            OutboxService::new(store.clone(), 10),
            Arc::new(InMemoryExecutionStore::new()),
            EngineConfig::default(),
        );
        engine.start(broker.as_ref()).await.unwrap();

        let relay = OutboxRelay::new(
            store.clone(),
            broker.clone(),
            RelayConfig::default()
                .with_poll_interval(Duration::from_millis(10))
                .with_backoff(Duration::from_millis(10), Duration::from_millis(50)),
        );
        relay.start().unwrap();

        Self {
            engine,
            relay,
            store,
            broker,
            breakers,
            completions,
        }
    }

    async fn next_completion(&mut self, within: Duration) -> WorkflowMessage {
        tokio::time::timeout(within, self.completions.recv())
            .await
            .expect("workflow did not complete in time")
            .expect("completion channel closed")
    }

    async fn shutdown(self) {
        self.relay.stop().await;
        self.engine.stop().await.unwrap();
        self.broker.close().await.unwrap();
    }
}

fn order_registry(charge_failures: u32) -> (WorkflowRegistry, Arc<AtomicU32>) {
    let charge_calls = Arc::new(AtomicU32::new(0));
    let calls = charge_calls.clone();

    let registry = WorkflowRegistry::builder()
        .step(
            StepDefinition::builder(
                CHARGE,
                handler_fn(move |message: WorkflowMessage| {
                    let calls = calls.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < charge_failures {
                            return Err(HandlerError::retryable("payment gateway timeout"));
                        }
                        let order_id = message.payload["order_id"].clone();
                        Ok(StepOutcome::success_with(json!({
                            "order_id": order_id,
                            "charged": true,
                        })))
                    }
                }),
            )
            .max_retries(2)
            .backoff(BackoffPolicy::fixed(Duration::from_millis(10)))
            .next(SHIP),
        )
        .step(StepDefinition::builder(
            SHIP,
            handler_fn(|message: WorkflowMessage| async move {
                let mut payload = message.payload;
                payload["shipped"] = Value::Bool(true);
                Ok(StepOutcome::success_with(payload))
            }),
        ))
        .build()
        .unwrap();

    (registry, charge_calls)
}

// ============================================
// Happy path
// ============================================

#[tokio::test]
async fn test_workflow_completes_over_log_broker() {
    let (registry, _) = order_registry(0);
    let delegate = Arc::new(InMemoryLogBroker::new(BrokerConfig::new(BrokerKind::Log)));
    let mut pipeline = Pipeline::start(registry, delegate, CircuitBreakerConfig::default()).await;

    let workflow_id = pipeline
        .engine
        .start_workflow(CHARGE, json!({ "order_id": 42 }))
        .await
        .unwrap();

    let completion = pipeline.next_completion(Duration::from_secs(5)).await;
    assert_eq!(completion.workflow_id, workflow_id);
    assert_eq!(completion.payload["order_id"], 42);
    assert_eq!(completion.payload["charged"], true);
    assert_eq!(completion.payload["shipped"], true);

    for topic in [CHARGE, SHIP] {
        let record = pipeline
            .engine
            .execution(workflow_id, topic)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Succeeded, "{topic}");
        assert_eq!(record.attempt, 1);
    }

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_workflows_are_isolated_over_queue_broker() {
    let (registry, _) = order_registry(0);
    let delegate = Arc::new(InMemoryQueueBroker::new(BrokerConfig::new(BrokerKind::Queue)));
    let mut pipeline = Pipeline::start(registry, delegate, CircuitBreakerConfig::default()).await;

    let mut started = Vec::new();
    for order_id in 0..5 {
        started.push(
            pipeline
                .engine
                .start_workflow(CHARGE, json!({ "order_id": order_id }))
                .await
                .unwrap(),
        );
    }

    let mut completed = Vec::new();
    for _ in 0..5 {
        completed.push(pipeline.next_completion(Duration::from_secs(5)).await.workflow_id);
    }
    started.sort();
    completed.sort();
    assert_eq!(started, completed);

    pipeline.shutdown().await;
}

// ============================================
// Failure handling
// ============================================

#[tokio::test]
async fn test_step_retry_then_success() {
    let (registry, charge_calls) = order_registry(1);
    let delegate = Arc::new(InMemoryQueueBroker::new(BrokerConfig::new(BrokerKind::Queue)));
    let mut pipeline = Pipeline::start(registry, delegate, CircuitBreakerConfig::default()).await;

    let workflow_id = pipeline
        .engine
        .start_workflow(CHARGE, json!({ "order_id": 7 }))
        .await
        .unwrap();

    let completion = pipeline.next_completion(Duration::from_secs(5)).await;
    assert_eq!(completion.workflow_id, workflow_id);
    assert_eq!(charge_calls.load(Ordering::SeqCst), 2);

    let charge = pipeline
        .engine
        .execution(workflow_id, CHARGE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(charge.status, ExecutionStatus::Succeeded);
    assert_eq!(charge.attempt, 2);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_broker_outage_defers_delivery_until_recovery() {
    let (registry, _) = order_registry(0);
    let delegate = Arc::new(InMemoryQueueBroker::new(BrokerConfig::new(BrokerKind::Queue)));
    delegate.set_available(false);

    let mut pipeline = Pipeline::start(
        registry,
        delegate.clone(),
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_open_duration(Duration::from_millis(200)),
    )
    .await;
    let monitor = HealthMonitor::new(
        pipeline.store.clone(),
        pipeline.broker.clone(),
        pipeline.breakers.clone(),
        100,
    );

    let workflow_id = pipeline
        .engine
        .start_workflow(CHARGE, json!({ "order_id": 9 }))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    let breaker = pipeline.breakers.get("broker-queue").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    let report = monitor.report().await;
    assert_eq!(report.circuit_status, HealthStatus::Down);
    assert_eq!(report.status, HealthStatus::Down);
    assert_eq!(report.outbox.pending, 1);
    assert_eq!(report.outbox.failed, 0);

    delegate.set_available(true);

    let completion = pipeline.next_completion(Duration::from_secs(5)).await;
    assert_eq!(completion.workflow_id, workflow_id);
    assert_eq!(breaker.state(), CircuitState::Closed);

    let counts = pipeline.store.counts().await.unwrap();
    assert_eq!(counts.failed, 0);
    assert_eq!(monitor.report().await.status, HealthStatus::Up);

    pipeline.shutdown().await;
}
