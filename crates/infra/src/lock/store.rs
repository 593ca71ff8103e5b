//! Atomic key-value store seam used by the distributed lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::sync::lock;

/// Store operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store command error: {0}")]
    Command(String),
}

/// The atomic primitives a lock needs from a shared store.
///
/// Every process racing for a key must talk to the same store; each operation
/// must be atomic with respect to all of them.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Set `key` to `value` with expiry `ttl` only if absent.
    /// Returns whether this call created the key.
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key` only if it currently holds `expected`.
    /// Returns whether the key was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S> AtomicStore for Arc<S>
where
    S: AtomicStore + ?Sized,
{
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        (**self).set_nx_px(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        (**self).delete_if_equals(key, expected).await
    }
}

#[derive(Debug)]
struct Slot {
    value: String,
    expires_at: Instant,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory atomic store for tests/dev.
///
/// Share one instance (via `Arc`) between lock instances to simulate several
/// processes racing against the same backing store.
#[derive(Debug, Default)]
pub struct InMemoryAtomicStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InMemoryAtomicStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a key unconditionally (test setup: simulate another holder).
    pub fn force_set(&self, key: &str, value: &str, ttl: Duration) {
        lock(&self.slots).insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remaining time-to-live of a live key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        lock(&self.slots)
            .get(key)
            .filter(|slot| slot.is_live(now))
            .map(|slot| slot.expires_at - now)
    }
}

#[async_trait]
impl AtomicStore for InMemoryAtomicStore {
    async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = lock(&self.slots);

        if slots.get(key).is_some_and(|slot| slot.is_live(now)) {
            return Ok(false);
        }

        slots.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut slots = lock(&self.slots);

        match slots.get(key) {
            Some(slot) if slot.is_live(now) => Ok(Some(slot.value.clone())),
            Some(_) => {
                slots.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = lock(&self.slots);

        let matches = slots
            .get(key)
            .is_some_and(|slot| slot.is_live(now) && slot.value == expected);
        if matches {
            slots.remove(key);
        }
        Ok(matches)
    }
}
