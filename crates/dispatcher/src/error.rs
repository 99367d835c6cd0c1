use thiserror::Error;

/// Errors a command or event handler can return.
///
/// All variants become an error reply; the message is what the orchestrator
/// records as the step's failure reason.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The request is valid but the business rules refuse it.
    #[error("{0}")]
    Rejected(String),

    /// The payload is missing a field or has the wrong shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Anything else that went wrong inside the handler.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Shorthand for a business rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        HandlerError::Rejected(message.into())
    }

    /// Shorthand for a missing payload field.
    pub fn missing(field: &str) -> Self {
        HandlerError::InvalidPayload(format!("missing field '{field}'"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(e.to_string())
    }
}

impl From<event_bus::BusError> for HandlerError {
    fn from(e: event_bus::BusError) -> Self {
        HandlerError::Internal(e.to_string())
    }
}
