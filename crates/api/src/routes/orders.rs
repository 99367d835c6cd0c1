//! Saga-backed order endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use common::SagaId;
use saga::{OrderRequest, OrderSagaResult, SagaSnapshot};

use crate::AppState;
use crate::error::ApiError;

/// POST /api/coordinator/orders: runs an order saga to its end.
///
/// Answers 200 whether the saga completed or was aborted; the outcome is in
/// the body. Requests the coordinator refuses answer 400.
#[tracing::instrument(skip_all)]
pub async fn create(
    State(state): State<Arc<AppState>>,
    body: Result<Json<OrderRequest>, JsonRejection>,
) -> Result<Json<OrderSagaResult>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let result = state.coordinator.start_order(request).await?;
    tracing::info!(saga_id = %result.saga_id, status = %result.status, "order saga finished");
    Ok(Json(result))
}

/// GET /api/coordinator/orders/{saga_id}: current saga snapshot.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaSnapshot>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    Ok(Json(state.coordinator.get(saga_id).await?))
}

/// DELETE /api/coordinator/orders/{saga_id}: forces compensation of an
/// in-flight saga and returns its final snapshot.
#[tracing::instrument(skip(state))]
pub async fn abort(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaSnapshot>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    Ok(Json(state.coordinator.abort(saga_id).await?))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id '{id}': {e}")))
}
