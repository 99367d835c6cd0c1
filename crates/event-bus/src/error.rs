use std::time::Duration;

use common::CorrelationId;
use thiserror::Error;

/// Errors that can occur when talking to the bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// No reply arrived for a command within the caller's timeout.
    #[error("Command '{command}' timed out after {timeout:?} (correlation id {correlation_id})")]
    Timeout {
        command: String,
        correlation_id: CorrelationId,
        timeout: Duration,
    },

    /// The remote participant answered with an error reply.
    #[error("{service} rejected '{command}': {message}")]
    Remote {
        service: String,
        command: String,
        message: String,
    },

    /// The client was shut down while the call was pending.
    #[error("Event bus client has been shut down")]
    ClientShutdown,

    /// The reply listener gave up resubscribing, so no reply could arrive.
    #[error("Reply listener on '{0}' is down")]
    ListenerUnhealthy(String),

    /// The topic was closed by the bus.
    #[error("Topic closed: {0}")]
    TopicClosed(String),

    /// A message on the bus did not have the expected envelope shape.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
