//! Workflow message: the unit transported on a topic

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the 1-based dispatch attempt of a step message
pub const ATTEMPT_HEADER: &str = "x-attempt";

/// Header carrying the trace id shared by every message of a workflow instance
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Header carrying an error code on dead-letter messages
pub const ERROR_CODE_HEADER: &str = "x-error-code";

/// Header carrying the last error message on dead-letter messages
pub const ERROR_MESSAGE_HEADER: &str = "x-error-message";

/// Header naming the step topic a derived message originated from
pub const SOURCE_TOPIC_HEADER: &str = "x-source-topic";

/// A message flowing between workflow steps
///
/// Value type: cloned when handed to handlers, never shared mutably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMessage {
    /// Correlates all messages of one workflow instance
    pub workflow_id: Uuid,

    /// Topic of the step this message drives
    pub step_topic: String,

    /// Opaque step payload
    pub payload: serde_json::Value,

    /// String headers (attempt count, trace id, error info)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// When the message was produced
    pub produced_at: DateTime<Utc>,
}

impl WorkflowMessage {
    /// Create the first message of a step, attempt 1
    pub fn new(workflow_id: Uuid, step_topic: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(ATTEMPT_HEADER.to_string(), "1".to_string());
        headers.insert(TRACE_ID_HEADER.to_string(), workflow_id.simple().to_string());

        Self {
            workflow_id,
            step_topic: step_topic.into(),
            payload,
            headers,
            produced_at: Utc::now(),
        }
    }

    /// Set a header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Current attempt (1-based). Missing or malformed headers count as the first attempt.
    pub fn attempt(&self) -> u32 {
        self.header(ATTEMPT_HEADER)
            .and_then(|v| v.parse().ok())
            .filter(|a| *a > 0)
            .unwrap_or(1)
    }

    /// Trace id, if the producer set one
    pub fn trace_id(&self) -> Option<&str> {
        self.header(TRACE_ID_HEADER)
    }

    /// Copy of this message for the given attempt of the same step
    pub fn for_attempt(&self, attempt: u32) -> Self {
        let mut next = self.clone();
        next.headers
            .insert(ATTEMPT_HEADER.to_string(), attempt.to_string());
        next.produced_at = Utc::now();
        next
    }

    /// Message for another topic in the same workflow instance, attempt 1
    ///
    /// Keeps the trace id and records the originating topic.
    pub fn derive(&self, topic: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut next = Self::new(self.workflow_id, topic, payload);
        if let Some(trace_id) = self.trace_id() {
            next.headers
                .insert(TRACE_ID_HEADER.to_string(), trace_id.to_string());
        }
        next.headers
            .insert(SOURCE_TOPIC_HEADER.to_string(), self.step_topic.clone());
        next
    }

    /// Partitioning key: messages of one workflow instance share a key
    pub fn key(&self) -> String {
        self.workflow_id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_starts_at_attempt_one() {
        let workflow_id = Uuid::now_v7();
        let msg = WorkflowMessage::new(workflow_id, "orders.validate", serde_json::json!({}));

        assert_eq!(msg.attempt(), 1);
        assert_eq!(msg.trace_id(), Some(workflow_id.simple().to_string().as_str()));
        assert_eq!(msg.key(), workflow_id.to_string());
    }

    #[test]
    fn test_malformed_attempt_header() {
        let msg = WorkflowMessage::new(Uuid::now_v7(), "t", serde_json::json!(null))
            .with_header(ATTEMPT_HEADER, "abc");
        assert_eq!(msg.attempt(), 1);

        let msg = msg.with_header(ATTEMPT_HEADER, "0");
        assert_eq!(msg.attempt(), 1);
    }

    #[test]
    fn test_for_attempt_keeps_payload() {
        let msg = WorkflowMessage::new(Uuid::now_v7(), "t", serde_json::json!({"n": 1}));
        let retry = msg.for_attempt(3);

        assert_eq!(retry.attempt(), 3);
        assert_eq!(retry.payload, msg.payload);
        assert_eq!(retry.workflow_id, msg.workflow_id);
        assert_eq!(retry.step_topic, "t");
    }

    #[test]
    fn test_derive_keeps_trace_and_source() {
        let msg = WorkflowMessage::new(Uuid::now_v7(), "orders.validate", serde_json::json!({}))
            .with_header(TRACE_ID_HEADER, "trace-123")
            .with_header(ATTEMPT_HEADER, "2");

        let next = msg.derive("orders.charge", serde_json::json!({"ok": true}));

        assert_eq!(next.step_topic, "orders.charge");
        assert_eq!(next.attempt(), 1);
        assert_eq!(next.trace_id(), Some("trace-123"));
        assert_eq!(next.header(SOURCE_TOPIC_HEADER), Some("orders.validate"));
        assert_eq!(next.workflow_id, msg.workflow_id);
    }
}
