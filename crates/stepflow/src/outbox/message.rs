//! Outbox record model

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{BrokerError, WorkflowMessage};
use crate::reliability::BackoffPolicy;

/// Delivery status of an outbox record
///
/// PENDING is the only non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown outbox status: {}", other)),
        }
    }
}

/// Why a record was staged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxKind {
    /// First message of a step (workflow start or next step)
    Workflow,
    /// Re-dispatch of a failed step
    Retry,
    /// Workflow completion notice
    Completion,
    /// Dead-lettered step
    DeadLetter,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Retry => "retry",
            Self::Completion => "completion",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for OutboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "retry" => Ok(Self::Retry),
            "completion" => Ok(Self::Completion),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown outbox kind: {}", other)),
        }
    }
}

/// Durable record of a message waiting to be published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub destination_topic: String,
    pub kind: OutboxKind,
    pub payload: serde_json::Value,
    pub headers: BTreeMap<String, String>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    /// Relay instance currently holding the claim
    pub claimed_by: Option<String>,

    /// When the current claim lapses
    pub claim_expires_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Stage `message` for its own step topic
    ///
    /// `not_before` delays the first publish attempt (retry backoff).
    pub fn pending(
        message: &WorkflowMessage,
        kind: OutboxKind,
        max_attempts: u32,
        not_before: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id: message.workflow_id,
            destination_topic: message.step_topic.clone(),
            kind,
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            status: OutboxStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: not_before.unwrap_or(now),
            sent_at: None,
            last_error: None,
            claimed_by: None,
            claim_expires_at: None,
        }
    }

    /// The message the relay publishes for this record
    pub fn to_workflow_message(&self) -> WorkflowMessage {
        WorkflowMessage {
            workflow_id: self.workflow_id,
            step_topic: self.destination_topic.clone(),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            produced_at: self.created_at,
        }
    }

    /// Whether a relay may claim this record at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && self.next_attempt_at <= now
            && self.claim_expires_at.map_or(true, |expires| expires < now)
    }

    /// Whether the current claim stays live for at least `span` after `now`
    pub fn claim_covers(&self, now: DateTime<Utc>, span: std::time::Duration) -> bool {
        let Ok(span) = chrono::Duration::from_std(span) else {
            return false;
        };
        self.claim_expires_at
            .is_some_and(|expires| expires - now > span)
    }

    /// State after a failed publish attempt
    ///
    /// Permanent errors fail the record at once. Transient errors consume one
    /// attempt and schedule the next with backoff until the budget runs out.
    pub fn after_failure(
        &self,
        error: &BrokerError,
        backoff: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> AttemptUpdate {
        let attempts = self.attempts.saturating_add(1);
        let exhausted = attempts >= self.max_attempts;

        let (status, next_attempt_at) = if error.is_permanent() || exhausted {
            (OutboxStatus::Failed, self.next_attempt_at)
        } else {
            let delay = backoff.delay_for_retry(attempts);
            (
                OutboxStatus::Pending,
                now + chrono::Duration::from_std(delay).unwrap_or_default(),
            )
        };

        AttemptUpdate {
            status,
            attempts,
            attempted_at: now,
            next_attempt_at,
            last_error: Some(error.to_string()),
        }
    }
}

/// Outcome of one failed publish attempt, applied by the store
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptUpdate {
    pub status: OutboxStatus,
    pub attempts: u32,
    pub attempted_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Record counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

impl OutboxCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.sent + self.failed
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn create_test_record(max_attempts: u32) -> OutboxMessage {
        let msg = WorkflowMessage::new(Uuid::now_v7(), "orders.charge", serde_json::json!({"n": 1}));
        OutboxMessage::pending(&msg, OutboxKind::Workflow, max_attempts, None)
    }

    #[test]
    fn test_pending_record() {
        let record = create_test_record(5);

        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.destination_topic, "orders.charge");
        assert!(record.is_claimable(Utc::now() + chrono::Duration::seconds(1)));

        let msg = record.to_workflow_message();
        assert_eq!(msg.step_topic, "orders.charge");
        assert_eq!(msg.attempt(), 1);
    }

    #[test]
    fn test_not_before_delays_claim() {
        let msg = WorkflowMessage::new(Uuid::now_v7(), "t", serde_json::json!(null));
        let later = Utc::now() + chrono::Duration::seconds(30);
        let record = OutboxMessage::pending(&msg, OutboxKind::Retry, 5, Some(later));

        assert!(!record.is_claimable(Utc::now()));
        assert!(record.is_claimable(later));
    }

    #[test]
    fn test_active_claim_blocks_other_relays() {
        let mut record = create_test_record(5);
        let now = Utc::now();
        record.claimed_by = Some("relay-a".into());
        record.claim_expires_at = Some(now + chrono::Duration::seconds(30));

        assert!(!record.is_claimable(now));
        assert!(record.is_claimable(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn test_transient_failure_schedules_retry() {
        let record = create_test_record(5);
        let backoff = BackoffPolicy::exponential()
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(0.0);
        let now = Utc::now();

        let update = record.after_failure(&BrokerError::transient("down"), &backoff, now);

        assert_eq!(update.status, OutboxStatus::Pending);
        assert_eq!(update.attempts, 1);
        assert_eq!(update.next_attempt_at, now + chrono::Duration::seconds(1));
        assert_eq!(update.last_error.as_deref(), Some("transient broker error: down"));
    }

    #[test]
    fn test_exhausted_budget_fails() {
        let mut record = create_test_record(3);
        record.attempts = 2;

        let update = record.after_failure(
            &BrokerError::transient("down"),
            &BackoffPolicy::exponential(),
            Utc::now(),
        );
        assert_eq!(update.status, OutboxStatus::Failed);
        assert_eq!(update.attempts, 3);
    }

    #[test]
    fn test_permanent_failure_is_immediate() {
        let record = create_test_record(5);

        let update = record.after_failure(
            &BrokerError::permanent("unroutable"),
            &BackoffPolicy::exponential(),
            Utc::now(),
        );
        assert_eq!(update.status, OutboxStatus::Failed);
        assert_eq!(update.attempts, 1);
    }

    #[test]
    fn test_status_parsing() {
        for status in [OutboxStatus::Pending, OutboxStatus::Sent, OutboxStatus::Failed] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("archived".parse::<OutboxStatus>().is_err());
        assert!(OutboxStatus::Sent.is_terminal());
        assert!(!OutboxStatus::Pending.is_terminal());
    }

    #[test]
    fn test_kind_parsing() {
        for kind in [
            OutboxKind::Workflow,
            OutboxKind::Retry,
            OutboxKind::Completion,
            OutboxKind::DeadLetter,
        ] {
            assert_eq!(kind.as_str().parse::<OutboxKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_counts_total() {
        let counts = OutboxCounts {
            pending: 2,
            sent: 5,
            failed: 1,
        };
        assert_eq!(counts.total(), 8);
    }
}
