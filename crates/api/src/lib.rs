//! HTTP API of the saga coordinator.
//!
//! Starts order sagas on request and exposes the in-memory saga table,
//! with structured logging (tracing) and Prometheus metrics. The bus and the
//! five participants run in-process.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_bus::{BusConfig, BusError, EventBusClient, InMemoryBus};
use metrics_exporter_prometheus::PrometheusHandle;
use participants::Participants;
use saga::SagaCoordinator;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub bus: InMemoryBus,
    pub client: Arc<EventBusClient>,
    pub coordinator: SagaCoordinator,
    pub participants: Participants,
}

impl AppState {
    /// Stops the participants and the coordinator's bus client.
    pub async fn shutdown(self) {
        self.participants.shutdown().await;
        self.client.shutdown().await;
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/api/coordinator/orders", post(routes::orders::create))
        .route(
            "/api/coordinator/orders/{saga_id}",
            get(routes::orders::get).delete(routes::orders::abort),
        )
        .route("/api/coordinator/sagas", get(routes::sagas::list))
        .route("/api/coordinator/health", get(routes::health::check))
        .route("/api/coordinator/statistics", get(routes::statistics::get))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the bus, starts the participants and the coordinator.
pub async fn create_default_state(config: &Config) -> Result<Arc<AppState>, BusError> {
    let bus = config.bus();

    let participants = participants::spawn_all(Arc::new(bus.clone()), config.participants()).await?;
    let client = Arc::new(EventBusClient::connect(Arc::new(bus.clone()), BusConfig::default()).await?);
    let coordinator = SagaCoordinator::new(client.clone(), config.coordinator()).with_publisher(client.clone());

    tracing::info!(
        service = client.service_name(),
        partitions = bus.partition_count(),
        "coordinator ready"
    );

    Ok(Arc::new(AppState {
        bus,
        client,
        coordinator,
        participants,
    }))
}
