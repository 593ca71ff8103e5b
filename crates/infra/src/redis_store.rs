//! Redis-backed lock store and dead-letter queue.
//!
//! - **Locks**: `SET key token NX PX ttl` to acquire, a Lua compare-and-delete
//!   to release. All processes must point at the same Redis.
//! - **DLQ**: each entry is a JSON string at `dlq:<message_id>` with an expiry,
//!   plus an id index list `dlq:messages` (newest first). Every `put` extends
//!   the index expiry to the retention, so an idle queue's index goes away
//!   with its last entry. Index ids whose entry expired are pruned by `list`
//!   across the whole index, not just the page it returns.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument, warn};

use courier_core::MessageId;

use crate::delivery::{DeadLetterStore, DlqEntry, DlqError};
use crate::lock::{AtomicStore, StoreError};

/// Default prefix of DLQ entry keys.
const DEFAULT_DLQ_PREFIX: &str = "dlq:";

/// Default DLQ index list key.
const DEFAULT_DLQ_INDEX_KEY: &str = "dlq:messages";

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Open a managed (auto-reconnecting) connection.
pub async fn connect(redis_url: impl AsRef<str>) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(redis_url.as_ref()).map_err(connection_error)?;
    ConnectionManager::new(client).await.map_err(connection_error)
}

fn connection_error(err: redis::RedisError) -> StoreError {
    StoreError::Connection(err.to_string())
}

fn command_error(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Command(err.to_string())
    }
}

/// TTL in milliseconds; Redis rejects `PX 0`.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// [`AtomicStore`] over a single Redis deployment.
#[derive(Clone)]
pub struct RedisAtomicStore {
    conn: ConnectionManager,
    compare_and_delete: redis::Script,
}

impl std::fmt::Debug for RedisAtomicStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisAtomicStore").finish_non_exhaustive()
    }
}

impl RedisAtomicStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        }
    }

    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self::new(connect(redis_url).await?))
    }
}

#[async_trait]
impl AtomicStore for RedisAtomicStore {
    #[instrument(skip(self, value), fields(ttl_ms = ttl_millis(ttl)))]
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        // Nil reply means the key already existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)
    }

    #[instrument(skip(self, expected))]
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .compare_and_delete
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(deleted == 1)
    }
}

/// [`DeadLetterStore`] over Redis.
#[derive(Clone)]
pub struct RedisDeadLetterStore {
    conn: ConnectionManager,
    key_prefix: String,
    index_key: String,
}

impl std::fmt::Debug for RedisDeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDeadLetterStore")
            .field("key_prefix", &self.key_prefix)
            .field("index_key", &self.index_key)
            .finish_non_exhaustive()
    }
}

fn storage_error(err: redis::RedisError) -> DlqError {
    DlqError::Storage(err.to_string())
}

impl RedisDeadLetterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_DLQ_PREFIX.to_string(),
            index_key: DEFAULT_DLQ_INDEX_KEY.to_string(),
        }
    }

    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, DlqError> {
        let conn = connect(redis_url)
            .await
            .map_err(|e| DlqError::Storage(e.to_string()))?;
        Ok(Self::new(conn))
    }

    /// Use a different key namespace (e.g. per environment).
    pub fn with_keys(mut self, key_prefix: impl Into<String>, index_key: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self.index_key = index_key.into();
        self
    }

    fn entry_key(&self, message_id: MessageId) -> String {
        format!("{}{}", self.key_prefix, message_id)
    }
}

#[async_trait]
impl DeadLetterStore for RedisDeadLetterStore {
    #[instrument(skip(self, entry), fields(message_id = %entry.message_id, tenant_id = %entry.tenant_id))]
    async fn put(&self, entry: &DlqEntry, retention: Duration) -> Result<(), DlqError> {
        let payload =
            serde_json::to_string(entry).map_err(|e| DlqError::Serialization(e.to_string()))?;
        let id = entry.message_id.to_string();
        let mut conn = self.conn.clone();

        // Re-putting an id moves it to the front of the index without duplicating it.
        let retention_ms = ttl_millis(retention);
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.entry_key(entry.message_id))
            .arg(payload)
            .arg("PX")
            .arg(retention_ms)
            .ignore()
            .cmd("LREM")
            .arg(&self.index_key)
            .arg(0)
            .arg(&id)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.index_key)
            .arg(&id)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&self.index_key)
            .arg(retention_ms)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(storage_error)
    }

    async fn get(&self, message_id: MessageId) -> Result<Option<DlqEntry>, DlqError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.entry_key(message_id))
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;

        payload
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| DlqError::Serialization(e.to_string()))
            })
            .transpose()
    }

    async fn remove(&self, message_id: MessageId) -> Result<bool, DlqError> {
        let mut conn = self.conn.clone();
        let (deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.entry_key(message_id))
            .cmd("LREM")
            .arg(&self.index_key)
            .arg(0)
            .arg(message_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(deleted > 0)
    }

    async fn list(&self, limit: usize) -> Result<Vec<DlqEntry>, DlqError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.index_key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;

        let mut entries = Vec::with_capacity(limit.min(ids.len()));
        let mut stale = Vec::new();
        // Ids past the page, only checked for existence.
        let mut unread = Vec::new();

        for raw in ids {
            let Ok(message_id) = raw.parse::<MessageId>() else {
                warn!(id = %raw, "dropping malformed dlq index entry");
                stale.push(raw);
                continue;
            };
            if entries.len() >= limit {
                unread.push((raw, message_id));
                continue;
            }
            match self.get(message_id).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => stale.push(raw),
                Err(DlqError::Serialization(e)) => {
                    warn!(message_id = %message_id, error = %e, "skipping unreadable dlq entry");
                }
                Err(e) => return Err(e),
            }
        }

        if !unread.is_empty() {
            let mut pipe = redis::pipe();
            for (_, message_id) in &unread {
                pipe.cmd("EXISTS").arg(self.entry_key(*message_id));
            }
            let exists: Vec<i64> = pipe.query_async(&mut conn).await.map_err(storage_error)?;
            stale.extend(
                unread
                    .into_iter()
                    .zip(exists)
                    .filter(|(_, found)| *found == 0)
                    .map(|((raw, _), _)| raw),
            );
        }

        if !stale.is_empty() {
            debug!(count = stale.len(), "pruning expired dlq index entries");
            let mut pipe = redis::pipe();
            for id in &stale {
                pipe.cmd("LREM").arg(&self.index_key).arg(0).arg(id).ignore();
            }
            pipe.query_async::<_, ()>(&mut conn).await.map_err(storage_error)?;
        }

        Ok(entries)
    }
}
