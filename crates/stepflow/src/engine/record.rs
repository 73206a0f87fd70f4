//! Per-step execution records

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::outbox::StoreError;

/// Status of one step of one workflow instance
///
/// SUCCEEDED and DEAD are terminal. FAILED marks a step whose outcome could
/// not be persisted; the inbound message is requeued and the step runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    RetryScheduled,
    Dead,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RetryScheduled => "retry_scheduled",
            Self::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Execution state of one step of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionRecord {
    pub workflow_id: Uuid,
    pub topic: String,
    pub status: ExecutionStatus,

    /// Attempt currently running, or the next one when RETRY_SCHEDULED
    pub attempt: u32,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Last error
    pub error: Option<String>,
}

impl WorkflowExecutionRecord {
    /// New PENDING record for the first attempt
    pub fn pending(workflow_id: Uuid, topic: impl Into<String>) -> Self {
        Self {
            workflow_id,
            topic: topic.into(),
            status: ExecutionStatus::Pending,
            attempt: 1,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
            error: None,
        }
    }
}

/// Storage for execution records, keyed by workflow id and topic
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    /// Insert or replace a record
    async fn upsert(&self, record: &WorkflowExecutionRecord) -> Result<(), StoreError>;

    /// Insert a record unless one exists for the same step; true if inserted
    async fn insert_if_absent(&self, record: &WorkflowExecutionRecord) -> Result<bool, StoreError>;

    /// Load the record of one step
    async fn get(
        &self,
        workflow_id: Uuid,
        topic: &str,
    ) -> Result<Option<WorkflowExecutionRecord>, StoreError>;

    /// All step records of a workflow instance, oldest update first
    async fn list_for_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowExecutionRecord>, StoreError>;
}

/// In-memory implementation of ExecutionStore
#[derive(Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<(Uuid, String), WorkflowExecutionRecord>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn upsert(&self, record: &WorkflowExecutionRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .insert((record.workflow_id, record.topic.clone()), record.clone());
        Ok(())
    }

    async fn insert_if_absent(&self, record: &WorkflowExecutionRecord) -> Result<bool, StoreError> {
        let mut records = self.records.write();
        match records.entry((record.workflow_id, record.topic.clone())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn get(
        &self,
        workflow_id: Uuid,
        topic: &str,
    ) -> Result<Option<WorkflowExecutionRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .get(&(workflow_id, topic.to_string()))
            .cloned())
    }

    async fn list_for_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowExecutionRecord>, StoreError> {
        let mut records: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.updated_at);
        Ok(records)
    }
}
