//! Scheduled jobs.
//!
//! ## Design
//!
//! - Every run is gated by `DistributedLock`, so a job runs on one process
//!   per tick even when many processes schedule it
//! - The lock is released on every exit path; a crashed holder's lock expires
//! - Tenant-level failures are reported, never abort the whole run
//!
//! ## Components
//!
//! - `ScheduledJob`: a named unit of periodic work
//! - `JobScheduler` / `SchedulerHandle`: interval runner and its control handle
//! - `DispatchJob`: drains pending messages per tenant through delivery

pub mod dispatch;
pub mod scheduler;

pub use dispatch::{DispatchJob, DispatchReport, PendingMessageSource, TenantFailure};
pub use scheduler::{JobScheduler, ScheduledJob, SchedulerHandle, SchedulerStats};
