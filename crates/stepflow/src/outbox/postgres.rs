//! PostgreSQL implementation of OutboxStore
//!
//! Production persistence using PostgreSQL with:
//! - Exclusive relay claims via `FOR UPDATE SKIP LOCKED` plus an expiring lease
//! - Claim-guarded status updates that never touch terminal records
//! - Insert helpers usable inside the caller's own transaction

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{AttemptUpdate, OutboxCounts, OutboxMessage, OutboxStore, StoreError};

/// Schema migrations for the outbox table
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RETURNING_COLUMNS: &str = "id, workflow_id, destination_topic, kind, payload, headers, \
     status, attempts, max_attempts, created_at, last_attempt_at, next_attempt_at, sent_at, \
     last_error, claimed_by, claim_expires_at";

/// PostgreSQL implementation of OutboxStore
///
/// # Example
///
/// ```ignore
/// use stepflow::outbox::PostgresOutboxStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresOutboxStore::new(pool);
/// store.migrate().await?;
///
/// // Stage inside the business transaction
/// let mut tx = store.pool().begin().await?;
/// // ... business writes on &mut *tx ...
/// PostgresOutboxStore::insert_with(&mut *tx, &record).await?;
/// tx.commit().await?;
/// ```
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await.map_err(|e| {
            error!("Failed to run outbox migrations: {}", e);
            StoreError::Database(e.to_string())
        })
    }

    /// Insert a record through any executor, typically an open transaction
    ///
    /// The record becomes visible to relays only when the caller commits.
    pub async fn insert_with<'e, E>(executor: E, message: &OutboxMessage) -> Result<(), StoreError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let headers = serde_json::to_value(&message.headers)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO stepflow_outbox (
                id, workflow_id, destination_topic, kind, payload, headers,
                status, attempts, max_attempts, created_at, next_attempt_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(message.id)
        .bind(message.workflow_id)
        .bind(&message.destination_topic)
        .bind(message.kind.as_str())
        .bind(&message.payload)
        .bind(&headers)
        .bind(message.status.as_str())
        .bind(message.attempts as i32)
        .bind(message.max_attempts as i32)
        .bind(message.created_at)
        .bind(message.next_attempt_at)
        .execute(executor)
        .await;

        match result {
            Ok(_) => {
                debug!(id = %message.id, topic = %message.destination_topic, "staged outbox record");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(message.id))
            }
            Err(e) => {
                error!("Failed to insert outbox record: {}", e);
                Err(StoreError::Database(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self, message), fields(id = %message.id))]
    async fn insert(&self, message: &OutboxMessage) -> Result<(), StoreError> {
        Self::insert_with(&self.pool, message).await
    }

    #[instrument(skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM stepflow_outbox WHERE id = $1",
            RETURNING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(row_to_message).transpose()
    }

    #[instrument(skip(self))]
    async fn claim_batch(
        &self,
        claimant: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }

        // SKIP LOCKED keeps concurrent relays from blocking on each other's
        // candidate rows; the lease hides claimed rows until it expires.
        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM stepflow_outbox
                WHERE status = 'pending'
                  AND next_attempt_at <= NOW()
                  AND (claim_expires_at IS NULL OR claim_expires_at < NOW())
                ORDER BY next_attempt_at, created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE stepflow_outbox o
            SET claimed_by = $2,
                claim_expires_at = NOW() + ($3::bigint * INTERVAL '1 millisecond')
            FROM claimable c
            WHERE o.id = c.id
            RETURNING {}
            "#,
            RETURNING_COLUMNS
                .split(", ")
                .map(|c| format!("o.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(limit as i64)
        .bind(claimant)
        .bind(lease.as_millis() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim outbox records: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut claimed = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE order
        claimed.sort_by_key(|r| (r.next_attempt_at, r.created_at));

        if !claimed.is_empty() {
            debug!(claimant, count = claimed.len(), "claimed outbox records");
        }

        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn mark_sent(
        &self,
        id: Uuid,
        claimant: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stepflow_outbox
            SET status = 'sent',
                attempts = attempts + 1,
                last_attempt_at = $3,
                sent_at = $3,
                claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(claimant)
        .bind(sent_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to mark outbox record sent: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, update))]
    async fn record_failure(
        &self,
        id: Uuid,
        claimant: &str,
        update: &AttemptUpdate,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stepflow_outbox
            SET status = $3,
                attempts = $4,
                last_attempt_at = $5,
                next_attempt_at = $6,
                last_error = $7,
                claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(claimant)
        .bind(update.status.as_str())
        .bind(update.attempts as i32)
        .bind(update.attempted_at)
        .bind(update.next_attempt_at)
        .bind(&update.last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record outbox failure: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn release(
        &self,
        id: Uuid,
        claimant: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stepflow_outbox
            SET next_attempt_at = $3,
                claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(claimant)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM stepflow_outbox
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut counts = OutboxCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| StoreError::Database(e.to_string()))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| StoreError::Database(e.to_string()))?;
            match status.as_str() {
                "pending" => counts.pending = count as u64,
                "sent" => counts.sent = count as u64,
                "failed" => counts.failed = count as u64,
                other => debug!(status = other, "ignoring unknown outbox status"),
            }
        }

        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM stepflow_outbox
            WHERE status = 'sent' AND sent_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete sent outbox records: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }
}

fn row_to_message(row: &PgRow) -> Result<OutboxMessage, StoreError> {
    fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
    where
        T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    {
        row.try_get(name)
            .map_err(|e| StoreError::Database(format!("column {}: {}", name, e)))
    }

    let kind: String = col(row, "kind")?;
    let status: String = col(row, "status")?;
    let headers: serde_json::Value = col(row, "headers")?;
    let headers: BTreeMap<String, String> =
        serde_json::from_value(headers).map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(OutboxMessage {
        id: col(row, "id")?,
        workflow_id: col(row, "workflow_id")?,
        destination_topic: col(row, "destination_topic")?,
        kind: kind.parse().map_err(StoreError::Serialization)?,
        payload: col(row, "payload")?,
        headers,
        status: status.parse().map_err(StoreError::Serialization)?,
        attempts: col::<i32>(row, "attempts")? as u32,
        max_attempts: col::<i32>(row, "max_attempts")? as u32,
        created_at: col(row, "created_at")?,
        last_attempt_at: col(row, "last_attempt_at")?,
        next_attempt_at: col(row, "next_attempt_at")?,
        sent_at: col(row, "sent_at")?,
        last_error: col(row, "last_error")?,
        claimed_by: col(row, "claimed_by")?,
        claim_expires_at: col(row, "claim_expires_at")?,
    })
}
