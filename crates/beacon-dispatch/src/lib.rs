//! Outbound delivery: a bounded worker pool plus the two producers that
//! feed it, signed federation requests and webhook notifications.

pub mod error;
pub mod federation;
pub mod queue;
pub mod webhooks;

pub use error::DispatchError;
pub use queue::{Deliver, DeliveryJob, DeliveryOutcome, DispatchQueue, QueueSizing};
