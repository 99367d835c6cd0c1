//! Saga error types.

use std::time::Duration;

use common::SagaId;
use event_bus::BusError;
use thiserror::Error;

use crate::state::SagaStatus;

/// Errors that can occur during saga operations.
///
/// A failing step is not an error: it ends in an `ABORTED`
/// [`SagaOutcome`](crate::SagaOutcome).
#[derive(Debug, Error)]
pub enum SagaError {
    /// The saga is in an invalid state for the requested operation.
    #[error("Invalid saga state: {operation} not allowed while {status}")]
    InvalidState {
        operation: &'static str,
        status: SagaStatus,
    },

    /// The saga input was refused before any step ran.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No saga with this id is known.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// An aborted saga did not reach a terminal state in time.
    #[error("Saga {saga_id} did not finish compensating within {waited:?}")]
    AbortTimeout { saga_id: SagaId, waited: Duration },

    /// The saga task ended without producing an outcome.
    #[error("Saga {0} terminated unexpectedly")]
    Terminated(SagaId),

    /// Bus error outside of step execution.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
