//! Prometheus metrics recorder and endpoint.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Installs the global Prometheus recorder and describes the saga metrics.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    metrics::describe_counter!("saga_executions_total", "Sagas started");
    metrics::describe_counter!("saga_completed", "Sagas that completed every step");
    metrics::describe_counter!("saga_aborted", "Sagas that were compensated");
    metrics::describe_histogram!(
        "saga_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time from saga start to terminal status"
    );
    metrics::describe_counter!("bus_commands_sent_total", "Correlated commands sent");
    metrics::describe_counter!("bus_command_timeouts_total", "Commands whose reply never arrived");
    metrics::describe_counter!("dispatcher_commands_total", "Commands handled by participants");

    Ok(handle)
}

/// GET /metrics: Prometheus text exposition.
pub async fn render(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        handle.render(),
    )
}
