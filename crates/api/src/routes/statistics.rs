//! Coordinator statistics endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::CoordinatorStatistics;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct StatisticsResponse {
    pub service: String,
    pub sagas: CoordinatorStatistics,
    pub pending_replies: usize,
    pub listener_restarts: u32,
    pub bus_topics: Vec<String>,
}

/// GET /api/coordinator/statistics
pub async fn get(State(state): State<Arc<AppState>>) -> Json<StatisticsResponse> {
    Json(StatisticsResponse {
        service: state.client.service_name().to_string(),
        sagas: state.coordinator.statistics().await,
        pending_replies: state.client.pending_count(),
        listener_restarts: state.client.listener_restarts(),
        bus_topics: state.bus.topic_names().await,
    })
}
