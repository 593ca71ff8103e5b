//! Outbound SMS message as handed to the delivery layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{MessageId, TenantId};

/// A message queued for delivery to one recipient.
///
/// Content is opaque here; carrier payload construction happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: MessageId,
    pub tenant_id: TenantId,
    pub recipient: String,
    pub content: String,
    pub queued_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Build a message with a fresh id, rejecting blank recipients.
    pub fn new(
        tenant_id: TenantId,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> DomainResult<Self> {
        Self::with_id(MessageId::new(), tenant_id, recipient, content)
    }

    /// Build a message with a caller-supplied id (replays, idempotent resubmits).
    pub fn with_id(
        message_id: MessageId,
        tenant_id: TenantId,
        recipient: impl Into<String>,
        content: impl Into<String>,
    ) -> DomainResult<Self> {
        let recipient = recipient.into();
        if recipient.trim().is_empty() {
            return Err(DomainError::validation("recipient must not be empty"));
        }

        Ok(Self {
            message_id,
            tenant_id,
            recipient,
            content: content.into(),
            queued_at: Utc::now(),
        })
    }
}
