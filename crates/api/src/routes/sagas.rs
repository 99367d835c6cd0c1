//! Saga listing endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::SagaSummary;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct SagaListResponse {
    pub count: usize,
    pub sagas: Vec<SagaSummary>,
}

/// GET /api/coordinator/sagas: every retained saga with step progress.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<SagaListResponse> {
    let sagas = state.coordinator.list().await;
    Json(SagaListResponse {
        count: sagas.len(),
        sagas,
    })
}
