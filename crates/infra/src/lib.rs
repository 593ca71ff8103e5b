//! Infrastructure layer: the reliability and resource-coordination services
//! that sit between application logic and the carrier / tenant databases.
//!
//! - [`cache`]: per-tenant handle cache with LRU eviction and idle expiry
//! - [`circuit_breaker`]: per-upstream health gate
//! - [`delivery`]: retrying send pipeline with a dead-letter queue
//! - [`lock`]: cluster-wide mutual exclusion for scheduled jobs
//! - [`jobs`]: scheduled job runner wiring the pieces together
//!
//! All services are explicit instances constructed at startup and shared by
//! `Arc`; nothing here is a process global.

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod deadline;
pub mod delivery;
pub mod jobs;
pub mod lock;

/// Redis adapters (atomic KV store for locks, DLQ persistence).
#[cfg(feature = "redis")]
pub mod redis_store;

mod sync;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, ReliabilityConfig};
pub use deadline::{Deadline, DeadlineExceeded};
