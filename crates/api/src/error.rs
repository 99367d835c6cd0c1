//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use thiserror::Error;

/// API-level error type that maps to HTTP responses.
///
/// A saga that ends `ABORTED` is not an error: it is a normal 200 response.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0}")]
    NotFound(String),

    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),

    /// Saga engine error at the coordinator boundary.
    #[error(transparent)]
    Saga(#[from] SagaError),

    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::NotFound(_) => StatusCode::NOT_FOUND,
        SagaError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SagaError::InvalidState { .. } => StatusCode::CONFLICT,
        SagaError::AbortTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SagaError::Terminated(_) | SagaError::Bus(_) => {
            tracing::error!(error = %err, "saga coordinator failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SagaId;
    use saga::SagaStatus;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_saga_errors_map_to_client_statuses() {
        assert_eq!(
            status_of(SagaError::NotFound(SagaId::new()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(
                SagaError::InvalidState {
                    operation: "abort",
                    status: SagaStatus::Completed,
                }
                .into()
            ),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::InvalidRequest("items must not be empty".into()).into()),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_unexpected_failures_are_internal() {
        assert_eq!(
            status_of(SagaError::Terminated(SagaId::new()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(ApiError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
