//! Execution state transition notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ExecutionStatus;

/// One execution record transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub workflow_id: Uuid,
    pub topic: String,
    /// `None` when the record was just created
    pub from: Option<ExecutionStatus>,
    pub to: ExecutionStatus,
    pub attempt: u32,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Receives every execution record transition
///
/// Called inline on the delivery path after the record is persisted, so
/// implementations should return quickly.
pub trait ExecutionObserver: Send + Sync + 'static {
    fn on_transition(&self, event: &TransitionEvent);
}
