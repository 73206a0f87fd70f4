mod demo;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use stepflow::broker::{message_handler, MessageBroker};
use stepflow::config::StepflowConfig;
use stepflow::engine::{ExecutionEngine, InMemoryExecutionStore, COMPLETED_SUFFIX};
use stepflow::health::{HealthMonitor, HealthStatus};
use stepflow::outbox::{
    InMemoryOutboxStore, OutboxRelay, OutboxService, OutboxStore, PostgresOutboxStore,
};
use stepflow::reliability::{CircuitBreakerRegistry, ResilientBroker};
use stepflow::telemetry::{init_telemetry, TelemetryConfig};
use stepflow::workflow::WorkflowRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - STEPFLOW_SERVICE_NAME: Service name (default: "stepflow-worker")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "stepflow=info,stepflow_worker=debug")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "stepflow" {
        telemetry_config.service_name = "stepflow-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("stepflow=info,stepflow_worker=debug".to_string());
    }
    init_telemetry(telemetry_config).context("Failed to initialize telemetry")?;

    tracing::info!("stepflow-worker starting...");

    let config = StepflowConfig::from_env();
    tracing::info!(
        broker = ?config.broker.backend,
        partitions = config.broker.partitions,
        postgres = config.database_url.is_some(),
        max_concurrency = config.engine.max_concurrency,
        "Loaded configuration"
    );

    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
    let broker: Arc<dyn MessageBroker> = Arc::new(
        ResilientBroker::new(config.broker.build(), &breakers)
            .with_call_timeout(config.relay.effective_publish_timeout()),
    );
    let store = create_outbox_store(&config).await?;

    let registry = demo::order_registry(config.step_defaults.clone())
        .context("Invalid workflow registry")?;
    let engine = create_engine(registry, store.clone(), &config);
    engine
        .start(broker.as_ref())
        .await
        .context("Failed to start execution engine")?;

    let completion_topic = format!("{}{}", demo::SHIP_TOPIC, COMPLETED_SUFFIX);
    broker
        .subscribe(
            &completion_topic,
            message_handler(|message, ctx| async move {
                tracing::info!(
                    workflow_id = %message.workflow_id,
                    payload = %message.payload,
                    "Order workflow completed"
                );
                if let Err(e) = ctx.acknowledge() {
                    tracing::warn!(error = %e, "Failed to acknowledge completion");
                }
            }),
        )
        .await
        .context("Failed to subscribe to completions")?;

    let relay = OutboxRelay::new(store.clone(), broker.clone(), config.relay.clone());
    relay.start().context("Failed to start outbox relay")?;

    let demo_orders: u64 = std::env::var("STEPFLOW_DEMO_ORDERS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3);
    for order_id in 1..=demo_orders {
        let workflow_id = engine
            .start_workflow(demo::CHARGE_TOPIC, demo::order_payload(order_id, order_id * 2_500))
            .await
            .context("Failed to start demo workflow")?;
        tracing::info!(%workflow_id, order_id, "Started demo order");
    }

    let monitor = HealthMonitor::new(
        store,
        broker.clone(),
        breakers,
        config.outbox_pending_threshold,
    );
    let health_interval = std::env::var("STEPFLOW_HEALTH_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(30));

    // Run until shutdown
    tokio::select! {
        _ = report_health(&monitor, health_interval) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    relay.stop().await;
    if let Err(e) = engine.stop().await {
        tracing::warn!(error = %e, "Execution engine did not drain cleanly");
    }
    if let Err(e) = broker.close().await {
        tracing::warn!(error = %e, "Failed to close broker");
    }

    tracing::info!(stats = ?relay.stats(), "Worker shutdown complete");
    Ok(())
}

async fn create_outbox_store(config: &StepflowConfig) -> Result<Arc<dyn OutboxStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let store = PostgresOutboxStore::new(pool);
            store.migrate().await.context("Failed to run outbox migrations")?;
            tracing::info!("Using PostgreSQL outbox store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory outbox store");
            Ok(Arc::new(InMemoryOutboxStore::new()))
        }
    }
}

fn create_engine(
    registry: WorkflowRegistry,
    store: Arc<dyn OutboxStore>,
    config: &StepflowConfig,
) -> ExecutionEngine {
    ExecutionEngine::new(
        Arc::new(registry),
        OutboxService::new(store, config.outbox_max_attempts),
        Arc::new(InMemoryExecutionStore::new()),
        config.engine.clone(),
    )
}

async fn report_health(monitor: &HealthMonitor, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let report = monitor.report().await;
        match report.status {
            HealthStatus::Up => tracing::info!(
                pending = report.outbox.pending,
                sent = report.outbox.sent,
                "Health UP"
            ),
            status => tracing::warn!(
                %status,
                outbox = %report.outbox.status,
                circuits = %report.circuit_status,
                broker_available = report.broker.available,
                failed = report.outbox.failed,
                "Health degraded"
            ),
        }
    }
}
