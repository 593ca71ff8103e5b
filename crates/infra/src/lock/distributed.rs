//! Token-verified distributed lock over an [`AtomicStore`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::store::{AtomicStore, StoreError};

/// Key namespace for job locks.
pub const DEFAULT_KEY_PREFIX: &str = "job:lock:";

/// Lock defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// TTL used by `acquire_default` / scheduled jobs (default: 5 minutes).
    pub default_ttl: Duration,
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Lock error. Contention is not an error; see [`DistributedLock::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock ttl must be at least 1ms")]
    InvalidTtl,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Proof of holding a lock; required to release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What `release` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Our token was present and the key was deleted.
    Released,
    /// The key was already gone (TTL expiry).
    Expired,
    /// Someone else holds the key now; it was left untouched.
    HeldByOther,
}

/// Result of [`DistributedLock::with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was acquired and the closure ran.
    Ran(T),
    /// Another holder owns the lock; nothing ran.
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, LockOutcome::Skipped)
    }

    pub fn into_ran(self) -> Option<T> {
        match self {
            LockOutcome::Ran(value) => Some(value),
            LockOutcome::Skipped => None,
        }
    }
}

/// Cluster-wide mutual exclusion keyed by job name.
#[derive(Debug)]
pub struct DistributedLock<S> {
    store: Arc<S>,
    config: LockConfig,
}

impl<S> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: AtomicStore> DistributedLock<S> {
    pub fn new(store: Arc<S>, config: LockConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Store key for a job's lock.
    pub fn key(&self, job_name: &str) -> String {
        format!("{}{}", self.config.key_prefix, job_name)
    }

    /// Try to take the lock. `Ok(None)` means another holder owns it.
    pub async fn acquire(&self, job_name: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        if ttl < Duration::from_millis(1) {
            return Err(LockError::InvalidTtl);
        }

        let token = LockToken::generate();
        let key = self.key(job_name);
        let acquired = self.store.set_nx_px(&key, token.as_str(), ttl).await?;

        if acquired {
            info!(job = job_name, ttl_ms = ttl.as_millis() as u64, "job lock acquired");
            Ok(Some(token))
        } else {
            debug!(job = job_name, "job lock held elsewhere");
            Ok(None)
        }
    }

    pub async fn acquire_default(&self, job_name: &str) -> Result<Option<LockToken>, LockError> {
        self.acquire(job_name, self.config.default_ttl).await
    }

    /// Release the lock if `token` still owns it.
    ///
    /// Never deletes another holder's lock: a caller whose TTL lapsed and
    /// whose key was re-acquired gets [`ReleaseOutcome::HeldByOther`].
    pub async fn release(&self, job_name: &str, token: &LockToken) -> Result<ReleaseOutcome, LockError> {
        let key = self.key(job_name);

        match self.store.get(&key).await? {
            None => {
                debug!(job = job_name, "job lock already expired");
                Ok(ReleaseOutcome::Expired)
            }
            Some(current) if current != token.as_str() => {
                warn!(job = job_name, "job lock now held by another owner; not releasing");
                Ok(ReleaseOutcome::HeldByOther)
            }
            Some(_) => {
                // Compare-and-delete: the key may have expired since the read.
                if self.store.delete_if_equals(&key, token.as_str()).await? {
                    info!(job = job_name, "job lock released");
                    Ok(ReleaseOutcome::Released)
                } else {
                    debug!(job = job_name, "job lock expired during release");
                    Ok(ReleaseOutcome::Expired)
                }
            }
        }
    }
}

impl<S: AtomicStore + 'static> DistributedLock<S> {
    /// Run `f` while holding the lock, or skip if it is held elsewhere.
    ///
    /// The lock is released whether `f` returns an error, panics, or the
    /// returned future is dropped mid-run; release failures are logged and
    /// left to TTL expiry.
    pub async fn with_lock<F, Fut, T>(
        &self,
        job_name: &str,
        ttl: Duration,
        f: F,
    ) -> Result<LockOutcome<T>, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(token) = self.acquire(job_name, ttl).await? else {
            info!(job = job_name, "job skipped; lock held elsewhere");
            return Ok(LockOutcome::Skipped);
        };

        let mut guard = ReleaseGuard {
            lock: self.clone(),
            job_name: job_name.to_string(),
            token: Some(token),
        };

        let output = f().await;

        if let Some(token) = guard.token.take() {
            if let Err(err) = self.release(job_name, &token).await {
                error!(job = job_name, error = %err, "failed to release job lock; it will expire");
            }
        }
        Ok(LockOutcome::Ran(output))
    }
}

/// Releases on drop when the normal path did not (panic, cancellation).
struct ReleaseGuard<S: AtomicStore + 'static> {
    lock: DistributedLock<S>,
    job_name: String,
    token: Option<LockToken>,
}

impl<S: AtomicStore + 'static> Drop for ReleaseGuard<S> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(job = %self.job_name, "no runtime to release job lock; it will expire");
            return;
        };

        let lock = self.lock.clone();
        let job_name = std::mem::take(&mut self.job_name);
        runtime.spawn(async move {
            if let Err(err) = lock.release(&job_name, &token).await {
                error!(job = %job_name, error = %err, "failed to release job lock; it will expire");
            }
        });
    }
}
