//! Process configuration

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::{BrokerConfig, BrokerKind};
use crate::engine::EngineConfig;
use crate::outbox::RelayConfig;
use crate::reliability::CircuitBreakerConfig;
use crate::workflow::StepDefaults;

/// Everything a hosting process needs to wire the core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepflowConfig {
    pub broker: BrokerConfig,
    pub relay: RelayConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub step_defaults: StepDefaults,
    pub engine: EngineConfig,

    /// Publish budget of new outbox records
    pub outbox_max_attempts: u32,

    /// Pending count above which the outbox reports WARNING
    pub outbox_pending_threshold: u64,

    /// PostgreSQL outbox; in-memory when unset
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
}

impl Default for StepflowConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            relay: RelayConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            step_defaults: StepDefaults::default(),
            engine: EngineConfig::default(),
            outbox_max_attempts: 5,
            outbox_pending_threshold: 1000,
            database_url: None,
        }
    }
}

impl StepflowConfig {
    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults. `DATABASE_URL`
    /// selects the PostgreSQL outbox; everything else is `STEPFLOW_*`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = EnvReader(lookup);

        let backend: BrokerKind = env.parse("STEPFLOW_BROKER_BACKEND", defaults.broker.backend);
        let broker = BrokerConfig::new(backend).with_partitions(
            env.parse("STEPFLOW_BROKER_PARTITIONS", defaults.broker.partitions),
        );

        let relay = RelayConfig::default()
            .with_poll_interval(env.millis("STEPFLOW_RELAY_POLL_INTERVAL_MS", defaults.relay.poll_interval))
            .with_batch_size(env.parse("STEPFLOW_RELAY_BATCH_SIZE", defaults.relay.batch_size))
            .with_lease(env.millis("STEPFLOW_RELAY_LEASE_MS", defaults.relay.lease))
            .with_backoff(
                env.millis("STEPFLOW_OUTBOX_BASE_DELAY_MS", defaults.relay.base_delay),
                env.millis("STEPFLOW_OUTBOX_MAX_DELAY_MS", defaults.relay.max_delay),
            )
            .with_sent_retention(env.millis(
                "STEPFLOW_OUTBOX_SENT_RETENTION_MS",
                defaults.relay.sent_retention,
            ))
            .with_cleanup_interval(env.millis(
                "STEPFLOW_OUTBOX_CLEANUP_INTERVAL_MS",
                defaults.relay.cleanup_interval,
            ));

        let circuit_breaker = CircuitBreakerConfig::new()
            .with_failure_threshold(env.parse(
                "STEPFLOW_CB_FAILURE_THRESHOLD",
                defaults.circuit_breaker.failure_threshold,
            ))
            .with_window(env.millis("STEPFLOW_CB_WINDOW_MS", defaults.circuit_breaker.window))
            .with_open_duration(env.millis(
                "STEPFLOW_CB_OPEN_DURATION_MS",
                defaults.circuit_breaker.open_duration,
            ));

        let step_defaults = StepDefaults::default()
            .with_timeout(env.millis("STEPFLOW_STEP_TIMEOUT_MS", defaults.step_defaults.timeout))
            .with_max_retries(env.parse(
                "STEPFLOW_STEP_MAX_RETRIES",
                defaults.step_defaults.max_retries,
            ));

        let engine = EngineConfig::default().with_max_concurrency(env.parse(
            "STEPFLOW_ENGINE_MAX_CONCURRENCY",
            defaults.engine.max_concurrency,
        ));

        Self {
            broker,
            relay,
            circuit_breaker,
            step_defaults,
            engine,
            outbox_max_attempts: env
                .parse::<u32>("STEPFLOW_OUTBOX_MAX_ATTEMPTS", defaults.outbox_max_attempts)
                .max(1),
            outbox_pending_threshold: env.parse(
                "STEPFLOW_OUTBOX_PENDING_THRESHOLD",
                defaults.outbox_pending_threshold,
            ),
            database_url: env.get("DATABASE_URL").filter(|url| !url.trim().is_empty()),
        }
    }
}

struct EnvReader<F>(F);

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(default)
    }
}
