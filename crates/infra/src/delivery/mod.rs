//! Message delivery with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Attempts for one message are strictly sequential
//! - Every attempt consults the carrier's `CircuitBreaker` first
//! - Exponential backoff between attempts, optionally capped
//! - Exhausted messages are written to the dead-letter queue exactly once
//! - Broadcasts fan out concurrently and report partial failure as counts
//!
//! ## Components
//!
//! - `UpstreamSender`: the carrier seam
//! - `RetryPolicy`: attempt budget and backoff shape
//! - `DeadLetterStore`: persistence for exhausted messages (in-memory, Redis)
//! - `DeliveryOrchestrator`: runs the send loop, broadcasts, and DLQ replay

pub mod dlq;
pub mod orchestrator;
pub mod policy;
pub mod sender;
pub mod types;

pub use dlq::{DeadLetterStore, DlqError, InMemoryDeadLetterStore};
pub use orchestrator::{DeliveryError, DeliveryOrchestrator};
pub use policy::{DeliveryConfig, RetryPolicy};
pub use sender::UpstreamSender;
pub use types::{BroadcastResult, DeliveryAttemptResult, DlqEntry, SendOptions};
