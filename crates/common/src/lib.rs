//! Shared identifiers and payload helpers used by every crate in the workspace.

pub mod payload;
pub mod types;

pub use payload::{Payload, epoch_seconds, merge, merged};
pub use types::{CorrelationId, EventId, SagaId};
