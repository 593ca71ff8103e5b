//! Cluster-wide mutual exclusion for scheduled jobs.
//!
//! ## Design
//!
//! - Locks are keys in a shared store, written with set-if-absent + expiry
//! - The holder gets a random token; only that token can release the lock
//! - Contention is a normal outcome (`None`), not an error
//! - A crashed holder's lock expires after its TTL
//!
//! ## Components
//!
//! - `AtomicStore`: the store seam (in-memory here, Redis in `redis_store`)
//! - `DistributedLock`: acquire / release / `with_lock`

pub mod distributed;
pub mod store;

pub use distributed::{DistributedLock, LockConfig, LockError, LockOutcome, LockToken, ReleaseOutcome};
pub use store::{AtomicStore, InMemoryAtomicStore, StoreError};
