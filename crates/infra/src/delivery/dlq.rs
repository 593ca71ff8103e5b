//! Dead-letter queue storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use courier_core::MessageId;

use super::types::DlqEntry;
use crate::sync::lock;

/// Dead-letter store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DlqError {
    #[error("dead-letter entry not found: {0}")]
    NotFound(MessageId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persistence for messages that exhausted their retries.
///
/// Entries are keyed by message id: writing an id that is already present
/// replaces the entry (a failed replay refreshes it).
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Store an entry that expires after `retention` unless removed first.
    async fn put(&self, entry: &DlqEntry, retention: Duration) -> Result<(), DlqError>;

    async fn get(&self, message_id: MessageId) -> Result<Option<DlqEntry>, DlqError>;

    /// Remove an entry. Returns whether it existed.
    async fn remove(&self, message_id: MessageId) -> Result<bool, DlqError>;

    /// Live entries, most recently stored first.
    async fn list(&self, limit: usize) -> Result<Vec<DlqEntry>, DlqError>;
}

#[async_trait]
impl<D> DeadLetterStore for Arc<D>
where
    D: DeadLetterStore + ?Sized,
{
    async fn put(&self, entry: &DlqEntry, retention: Duration) -> Result<(), DlqError> {
        (**self).put(entry, retention).await
    }

    async fn get(&self, message_id: MessageId) -> Result<Option<DlqEntry>, DlqError> {
        (**self).get(message_id).await
    }

    async fn remove(&self, message_id: MessageId) -> Result<bool, DlqError> {
        (**self).remove(message_id).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<DlqEntry>, DlqError> {
        (**self).list(limit).await
    }
}

#[derive(Debug)]
struct StoredEntry {
    entry: DlqEntry,
    expires_at: Instant,
}

/// In-memory dead-letter store for tests/dev. Honors retention.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: Mutex<HashMap<MessageId, StoredEntry>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let mut entries = lock(&self.entries);
        purge_expired(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn purge_expired(entries: &mut HashMap<MessageId, StoredEntry>) {
    let now = Instant::now();
    entries.retain(|_, stored| stored.expires_at > now);
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn put(&self, entry: &DlqEntry, retention: Duration) -> Result<(), DlqError> {
        let mut entries = lock(&self.entries);
        entries.insert(
            entry.message_id,
            StoredEntry {
                entry: entry.clone(),
                expires_at: Instant::now() + retention,
            },
        );
        Ok(())
    }

    async fn get(&self, message_id: MessageId) -> Result<Option<DlqEntry>, DlqError> {
        let mut entries = lock(&self.entries);
        purge_expired(&mut entries);
        Ok(entries.get(&message_id).map(|s| s.entry.clone()))
    }

    async fn remove(&self, message_id: MessageId) -> Result<bool, DlqError> {
        let mut entries = lock(&self.entries);
        purge_expired(&mut entries);
        Ok(entries.remove(&message_id).is_some())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DlqEntry>, DlqError> {
        let mut entries = lock(&self.entries);
        purge_expired(&mut entries);

        let mut result: Vec<DlqEntry> = entries.values().map(|s| s.entry.clone()).collect();
        result.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
        result.truncate(limit);
        Ok(result)
    }
}
