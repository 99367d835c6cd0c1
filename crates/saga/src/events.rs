//! Informational saga lifecycle events.
//!
//! Published by the orchestrator to `saga_coordinator_domain_events`, keyed by
//! saga id. They carry no business meaning: participants only log them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{Payload, SagaId};
use event_bus::{DomainEventPublisher, SAGA_COMPLETED, SAGA_FAILED, SAGA_STARTED};
use serde::Serialize;
use serde_json::Value;

use crate::state::SagaStatus;

/// Aggregate type stamped on lifecycle events.
pub const AGGREGATE_TYPE: &str = "saga";

/// Events the orchestrator emits about one saga.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SagaLifecycleEvent {
    Started(SagaStartedData),
    Completed(SagaCompletedData),
    Failed(SagaFailedData),
}

/// Data for `saga_started`.
#[derive(Debug, Clone, Serialize)]
pub struct SagaStartedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub step_count: usize,
    pub status: SagaStatus,
    pub started_at: DateTime<Utc>,
}

/// Data for `saga_completed`.
#[derive(Debug, Clone, Serialize)]
pub struct SagaCompletedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub completed_at: DateTime<Utc>,
}

/// Data for `saga_failed`, published once compensation has run.
#[derive(Debug, Clone, Serialize)]
pub struct SagaFailedData {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub failed_step: usize,
    pub failed_service: String,
    pub reason: String,
    pub compensated_steps: usize,
    pub failed_at: DateTime<Utc>,
}

impl SagaLifecycleEvent {
    /// Returns the wire event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaLifecycleEvent::Started(_) => SAGA_STARTED,
            SagaLifecycleEvent::Completed(_) => SAGA_COMPLETED,
            SagaLifecycleEvent::Failed(_) => SAGA_FAILED,
        }
    }

    /// Returns the saga the event is about.
    pub fn saga_id(&self) -> SagaId {
        match self {
            SagaLifecycleEvent::Started(data) => data.saga_id,
            SagaLifecycleEvent::Completed(data) => data.saga_id,
            SagaLifecycleEvent::Failed(data) => data.saga_id,
        }
    }

    fn event_data(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(data)) => data,
            _ => Payload::new(),
        }
    }
}

/// Publishes `event` if a publisher is attached. Failures are logged only.
pub(crate) async fn publish(publisher: Option<&Arc<dyn DomainEventPublisher>>, event: SagaLifecycleEvent) {
    let Some(publisher) = publisher else {
        return;
    };
    let saga_id = event.saga_id().to_string();
    if let Err(e) = publisher
        .publish_domain_event(event.event_type(), &saga_id, AGGREGATE_TYPE, event.event_data())
        .await
    {
        tracing::warn!(%saga_id, event_type = event.event_type(), error = %e, "failed to publish saga event");
    }
}
