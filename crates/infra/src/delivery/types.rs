//! Delivery results, options, and dead-letter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{MessageId, OutboundMessage, TenantId};

use super::policy::RetryPolicy;
use crate::deadline::Deadline;

/// Per-call overrides for [`send`](super::DeliveryOrchestrator::send).
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Replaces the orchestrator's retry policy for this call.
    pub retry: Option<RetryPolicy>,
    /// Overall budget for every attempt and backoff of this call.
    pub deadline: Deadline,
}

impl SendOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Outcome of one `send` call (all of its attempts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttemptResult {
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub recipient: String,
    pub success: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Carrier-assigned id when accepted.
    pub upstream_id: Option<String>,
    /// Whether the terminal failure was persisted to the DLQ.
    pub dead_lettered: bool,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryAttemptResult {
    pub(crate) fn delivered(message: &OutboundMessage, attempts: u32, upstream_id: String) -> Self {
        Self {
            message_id: message.message_id,
            tenant_id: message.tenant_id,
            recipient: message.recipient.clone(),
            success: true,
            attempts,
            last_error: None,
            upstream_id: Some(upstream_id),
            dead_lettered: false,
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn failed(message: &OutboundMessage, attempts: u32, last_error: Option<String>) -> Self {
        Self {
            message_id: message.message_id,
            tenant_id: message.tenant_id,
            recipient: message.recipient.clone(),
            success: false,
            attempts,
            last_error,
            upstream_id: None,
            dead_lettered: false,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate outcome of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BroadcastResult {
    pub successful: Vec<DeliveryAttemptResult>,
    pub failed: Vec<DeliveryAttemptResult>,
    /// Failed results that reached the DLQ.
    pub dlq_count: usize,
}

impl BroadcastResult {
    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    pub(crate) fn push(&mut self, result: DeliveryAttemptResult) {
        if result.success {
            self.successful.push(result);
        } else {
            if result.dead_lettered {
                self.dlq_count += 1;
            }
            self.failed.push(result);
        }
    }
}

/// A message that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub message_id: MessageId,
    pub recipient: String,
    pub content: String,
    pub tenant_id: TenantId,
    pub failure_reason: String,
    pub attempts: u32,
    /// When the final attempt failed.
    pub timestamp: DateTime<Utc>,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
}

impl DlqEntry {
    pub fn from_failure(message: &OutboundMessage, result: &DeliveryAttemptResult) -> Self {
        Self {
            message_id: message.message_id,
            recipient: message.recipient.clone(),
            content: message.content.clone(),
            tenant_id: message.tenant_id,
            failure_reason: result
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()),
            attempts: result.attempts,
            timestamp: result.timestamp,
            stored_at: Utc::now(),
        }
    }

    /// Rebuild the message for replay, keeping its id.
    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage {
            message_id: self.message_id,
            tenant_id: self.tenant_id,
            recipient: self.recipient.clone(),
            content: self.content.clone(),
            queued_at: self.timestamp,
        }
    }
}
