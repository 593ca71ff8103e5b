//! Per-tenant handle cache with strict LRU eviction and idle expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use courier_core::TenantId;

use super::handle::{HandleFactory, TenantHandle};
use crate::deadline::{Deadline, DeadlineExceeded};
use crate::sync::lock;

/// Cache sizing and expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of live tenant handles.
    pub max_size: usize,
    /// Entries unused for longer than this are closed by the sweep.
    pub idle_timeout: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
    /// Upper bound on a single handle creation.
    pub create_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            create_timeout: Duration::from_secs(10),
        }
    }
}

impl CacheConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// Handle lookup/creation error. Never cached: the next `get` retries fresh.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to create handle for tenant {tenant_id}: {source}")]
    Create {
        tenant_id: TenantId,
        #[source]
        source: anyhow::Error,
    },
    #[error("handle creation for tenant {tenant_id} timed out after {after:?}")]
    Timeout { tenant_id: TenantId, after: Duration },
}

/// Cache counters since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub create_failures: u64,
}

#[derive(Debug)]
struct CacheEntry<H> {
    handle: Arc<H>,
    created_at: Instant,
    last_used_at: Instant,
    /// Monotonic access stamp; the smallest value is the LRU entry.
    recency: u64,
}

#[derive(Debug)]
struct CacheState<H> {
    entries: HashMap<TenantId, CacheEntry<H>>,
    clock: u64,
}

impl<H> CacheState<H> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn lru_tenant(&self) -> Option<TenantId> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.recency)
            .map(|(tenant_id, _)| *tenant_id)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    create_failures: AtomicU64,
}

/// Caches one long-lived handle per tenant.
///
/// The map is guarded by a mutex that is never held across an await:
/// handle creation and `close()` run outside the critical section. A handle
/// is closed only by the caller that removed its entry from the map, so
/// overlapping eviction, sweep, and access never close it twice.
pub struct ResourceCache<H, F> {
    config: CacheConfig,
    factory: F,
    state: Mutex<CacheState<H>>,
    counters: Counters,
}

impl<H, F> std::fmt::Debug for ResourceCache<H, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCache")
            .field("config", &self.config)
            .field("size", &lock(&self.state).entries.len())
            .finish_non_exhaustive()
    }
}

impl<H, F> ResourceCache<H, F>
where
    H: TenantHandle,
    F: HandleFactory<H>,
{
    pub fn new(config: CacheConfig, factory: F) -> Self {
        Self {
            config,
            factory,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                clock: 0,
            }),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the tenant's handle, creating it on miss.
    pub async fn get(&self, tenant_id: TenantId) -> Result<Arc<H>, CacheError> {
        self.get_within(tenant_id, Deadline::none()).await
    }

    /// Like [`get`](Self::get), with creation also bounded by `deadline`.
    pub async fn get_within(
        &self,
        tenant_id: TenantId,
        deadline: Deadline,
    ) -> Result<Arc<H>, CacheError> {
        if let Some(handle) = self.touch(tenant_id) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(tenant_id = %tenant_id, "tenant handle cache hit");
            return Ok(handle);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(tenant_id = %tenant_id, "tenant handle cache miss");

        let created = deadline
            .run(self.config.create_timeout, self.factory.create(tenant_id))
            .await;

        let handle = match created {
            Ok(Ok(handle)) => Arc::new(handle),
            Ok(Err(source)) => {
                self.counters.create_failures.fetch_add(1, Ordering::Relaxed);
                warn!(tenant_id = %tenant_id, error = %source, "tenant handle creation failed");
                return Err(CacheError::Create { tenant_id, source });
            }
            Err(DeadlineExceeded(after)) => {
                self.counters.create_failures.fetch_add(1, Ordering::Relaxed);
                warn!(tenant_id = %tenant_id, after_ms = after.as_millis() as u64, "tenant handle creation timed out");
                return Err(CacheError::Timeout { tenant_id, after });
            }
        };

        let (handle, displaced) = self.insert(tenant_id, handle);
        for stale in displaced {
            stale.close().await;
        }
        Ok(handle)
    }

    /// Close and drop a single tenant's handle. Returns whether it was cached.
    pub async fn invalidate(&self, tenant_id: TenantId) -> bool {
        let removed = lock(&self.state).entries.remove(&tenant_id);
        match removed {
            Some(entry) => {
                debug!(tenant_id = %tenant_id, "tenant handle invalidated");
                entry.handle.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every entry idle longer than `idle_timeout`. Returns how many.
    pub async fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(TenantId, Arc<H>)> = {
            let mut state = lock(&self.state);
            let idle: Vec<TenantId> = state
                .entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_used_at) > self.config.idle_timeout)
                .map(|(tenant_id, _)| *tenant_id)
                .collect();
            idle.into_iter()
                .filter_map(|t| state.entries.remove(&t).map(|e| (t, e.handle)))
                .collect()
        };

        for (tenant_id, handle) in &expired {
            debug!(tenant_id = %tenant_id, "closing idle tenant handle");
            handle.close().await;
        }

        let count = expired.len();
        if count > 0 {
            self.counters
                .expirations
                .fetch_add(count as u64, Ordering::Relaxed);
            info!(expired = count, "idle tenant handles swept");
        }
        count
    }

    /// Close and drop every cached handle (shutdown).
    pub async fn clear(&self) {
        let drained: Vec<Arc<H>> = lock(&self.state)
            .entries
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect();
        for handle in drained {
            handle.close().await;
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, tenant_id: TenantId) -> bool {
        lock(&self.state).entries.contains_key(&tenant_id)
    }

    /// Age of a cached handle, if present.
    pub fn age(&self, tenant_id: TenantId) -> Option<Duration> {
        lock(&self.state)
            .entries
            .get(&tenant_id)
            .map(|e| e.created_at.elapsed())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            create_failures: self.counters.create_failures.load(Ordering::Relaxed),
        }
    }

    fn touch(&self, tenant_id: TenantId) -> Option<Arc<H>> {
        let mut state = lock(&self.state);
        let stamp = state.tick();
        let entry = state.entries.get_mut(&tenant_id)?;
        entry.last_used_at = Instant::now();
        entry.recency = stamp;
        Some(entry.handle.clone())
    }

    /// Insert a freshly created handle. Returns the handle to serve plus any
    /// handles that left the cache and now need closing.
    fn insert(&self, tenant_id: TenantId, handle: Arc<H>) -> (Arc<H>, Vec<Arc<H>>) {
        let mut state = lock(&self.state);
        let stamp = state.tick();
        let now = Instant::now();

        // A concurrent miss for the same tenant won the race: keep theirs.
        if let Some(existing) = state.entries.get_mut(&tenant_id) {
            existing.last_used_at = now;
            existing.recency = stamp;
            return (existing.handle.clone(), vec![handle]);
        }

        let mut displaced = Vec::new();
        while state.entries.len() >= self.config.max_size {
            let Some(victim) = state.lru_tenant() else {
                break;
            };
            if let Some(entry) = state.entries.remove(&victim) {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(tenant_id = %victim, "evicting least recently used tenant handle");
                displaced.push(entry.handle);
            }
        }

        state.entries.insert(
            tenant_id,
            CacheEntry {
                handle: handle.clone(),
                created_at: now,
                last_used_at: now,
                recency: stamp,
            },
        );
        (handle, displaced)
    }
}
