//! `courier-core`: domain primitives shared by the messaging layers.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod message;

pub use error::{DomainError, DomainResult};
pub use id::{MessageId, TenantId};
pub use message::OutboundMessage;
