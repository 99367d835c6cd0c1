//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: String,
    pub bus_healthy: bool,
    pub participants_healthy: bool,
    pub timestamp: DateTime<Utc>,
}

/// GET /api/coordinator/health: coordinator and bus client health.
///
/// `degraded` once a reply listener gave up restarting.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let bus_healthy = state.client.is_healthy();
    let participants_healthy = state.participants.is_healthy();
    Json(HealthResponse {
        status: if bus_healthy && participants_healthy {
            "healthy"
        } else {
            "degraded"
        },
        service: state.client.service_name().to_string(),
        bus_healthy,
        participants_healthy,
        timestamp: Utc::now(),
    })
}
