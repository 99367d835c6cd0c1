//! Handlers every dispatcher registers on construction.

use std::sync::Arc;

use async_trait::async_trait;
use common::{Payload, epoch_seconds};
use event_bus::{CommandEnvelope, DomainEventEnvelope, EventBusClient};
use serde_json::Value;

use crate::{CommandHandler, DispatcherStats, EventHandler, HandlerError};

/// `health_check`: reports the service and its bus connection state.
pub struct HealthCheck {
    client: Arc<EventBusClient>,
}

impl HealthCheck {
    pub fn new(client: Arc<EventBusClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CommandHandler for HealthCheck {
    async fn handle(&self, _payload: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let healthy = self.client.is_healthy();
        let mut result = Payload::new();
        result.insert("service".into(), Value::from(self.client.service_name()));
        result.insert(
            "status".into(),
            Value::from(if healthy { "healthy" } else { "degraded" }),
        );
        result.insert("bus_healthy".into(), Value::Bool(healthy));
        result.insert("timestamp".into(), Value::from(epoch_seconds()));
        Ok(result)
    }
}

/// `get_statistics`: returns the dispatcher counters.
pub struct GetStatistics {
    service: String,
    stats: Arc<DispatcherStats>,
}

impl GetStatistics {
    pub fn new(service: impl Into<String>, stats: Arc<DispatcherStats>) -> Self {
        Self {
            service: service.into(),
            stats,
        }
    }
}

#[async_trait]
impl CommandHandler for GetStatistics {
    async fn handle(&self, _payload: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let mut result = Payload::new();
        result.insert("service".into(), Value::from(self.service.as_str()));
        result.insert("statistics".into(), serde_json::to_value(self.stats.snapshot())?);
        Ok(result)
    }
}

/// Logs the orchestrator's informational saga lifecycle events.
pub struct SagaLifecycleLogger {
    service: String,
}

impl SagaLifecycleLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl EventHandler for SagaLifecycleLogger {
    async fn handle(&self, event: &DomainEventEnvelope) -> Result<(), HandlerError> {
        tracing::info!(
            service = %self.service,
            event_type = %event.event_type,
            saga_id = %event.aggregate_id,
            status = ?event.event_data.get("status"),
            "saga lifecycle event"
        );
        Ok(())
    }
}
