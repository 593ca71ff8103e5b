//! Per-tenant resource cache.
//!
//! ## Design
//!
//! - One long-lived handle per tenant, created on first use
//! - Bounded by `max_size` with strict LRU eviction
//! - Idle entries closed by a cancellable background sweep
//! - Creation failures are returned to the caller, never cached
//!
//! ## Components
//!
//! - `TenantHandle` / `HandleFactory`: the seam to the tenant resource
//! - `ResourceCache`: the cache itself
//! - `SweeperHandle`: controls the idle-expiry task

pub mod handle;
pub mod resource_cache;
pub mod sweeper;

pub use handle::{HandleFactory, PostgresHandleFactory, TenantHandle};
pub use resource_cache::{CacheConfig, CacheError, CacheStats, ResourceCache};
pub use sweeper::SweeperHandle;
