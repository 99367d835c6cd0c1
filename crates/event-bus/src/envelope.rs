//! Wire envelopes exchanged over the bus.

use chrono::{DateTime, Utc};
use common::{CorrelationId, EventId, Payload, SagaId, epoch_seconds};
use serde::{Deserialize, Serialize};

use crate::BusError;

/// Value of `command_type` on every saga command.
pub const COMMAND_TYPE: &str = "saga_command";

/// Current domain event schema version.
pub const EVENT_VERSION: u32 = 1;

/// Service name the orchestrator publishes under.
pub const COORDINATOR_SERVICE: &str = "saga_coordinator";

/// Informational saga lifecycle events published by the orchestrator.
pub const SAGA_STARTED: &str = "saga_started";
pub const SAGA_COMPLETED: &str = "saga_completed";
pub const SAGA_FAILED: &str = "saga_failed";

/// Topic a participant consumes its commands from.
pub fn command_topic(service: &str) -> String {
    format!("{service}_commands")
}

/// Topic a service publishes its domain events to.
pub fn domain_event_topic(service: &str) -> String {
    format!("{service}_domain_events")
}

/// A command sent by the orchestrator to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// The command name the participant dispatches on.
    pub command: String,

    /// Command input.
    pub payload: Payload,

    /// Routes the reply back to the waiting caller.
    pub correlation_id: CorrelationId,

    /// The saga this command belongs to (audit only).
    pub saga_id: Option<SagaId>,

    /// Where the participant must publish its reply.
    pub reply_topic: String,

    /// The service that issued the command.
    pub source_service: String,

    /// Always [`COMMAND_TYPE`].
    pub command_type: String,

    /// Epoch seconds at creation.
    pub timestamp: f64,
}

impl CommandEnvelope {
    /// Creates a command envelope stamped with the current time.
    pub fn new(
        command: impl Into<String>,
        payload: Payload,
        correlation_id: CorrelationId,
        saga_id: Option<SagaId>,
        reply_topic: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            payload,
            correlation_id,
            saga_id,
            reply_topic: reply_topic.into(),
            source_service: source_service.into(),
            command_type: COMMAND_TYPE.to_string(),
            timestamp: epoch_seconds(),
        }
    }
}

/// Outcome flag carried on every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// A participant's answer to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Copied from the command; `None` only when the command itself lacked one.
    pub correlation_id: Option<CorrelationId>,

    /// Copied from the command.
    pub saga_id: Option<SagaId>,

    /// The replying service.
    pub service: String,

    /// The command being answered, when known.
    pub command: Option<String>,

    /// Success or error.
    pub status: ReplyStatus,

    /// Handler result (success only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,

    /// Human readable failure reason (error only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Epoch seconds at creation.
    pub timestamp: f64,
}

impl ReplyEnvelope {
    /// Creates a success reply for `command`.
    pub fn success(command: &CommandEnvelope, service: impl Into<String>, payload: Payload) -> Self {
        Self {
            correlation_id: Some(command.correlation_id),
            saga_id: command.saga_id,
            service: service.into(),
            command: Some(command.command.clone()),
            status: ReplyStatus::Success,
            payload: Some(payload),
            error: None,
            timestamp: epoch_seconds(),
        }
    }

    /// Creates an error reply. Any of the routing fields may be missing when
    /// the inbound command was malformed.
    pub fn error(
        correlation_id: Option<CorrelationId>,
        saga_id: Option<SagaId>,
        service: impl Into<String>,
        command: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id,
            saga_id,
            service: service.into(),
            command,
            status: ReplyStatus::Error,
            payload: None,
            error: Some(error.into()),
            timestamp: epoch_seconds(),
        }
    }

    /// Returns true for success replies.
    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }

    /// Converts the reply into the caller-facing result.
    pub fn into_result(self) -> Result<Payload, BusError> {
        match self.status {
            ReplyStatus::Success => Ok(self.payload.unwrap_or_default()),
            ReplyStatus::Error => Err(BusError::Remote {
                service: self.service,
                command: self.command.unwrap_or_default(),
                message: self.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
        }
    }
}

/// A fact published by a service about one of its aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEventEnvelope {
    /// The event type (e.g. "order_cancelled").
    pub event_type: String,

    /// The aggregate the event is about; also the partition key.
    pub aggregate_id: String,

    /// The aggregate's type (e.g. "order").
    pub aggregate_type: String,

    /// Event body.
    pub event_data: Payload,

    /// Always [`EVENT_VERSION`] for now.
    pub event_version: u32,

    /// When the fact happened.
    pub occurred_at: DateTime<Utc>,

    /// Unique event identifier (bus enrichment).
    pub event_id: EventId,

    /// Publishing service (bus enrichment).
    pub service_name: String,

    /// Epoch seconds at publish (bus enrichment).
    pub timestamp: f64,
}

impl DomainEventEnvelope {
    /// Creates an event envelope stamped with a fresh id and the current time.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        event_data: Payload,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_data,
            event_version: EVENT_VERSION,
            occurred_at: Utc::now(),
            event_id: EventId::new(),
            service_name: service_name.into(),
            timestamp: epoch_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_command() -> CommandEnvelope {
        let mut payload = Payload::new();
        payload.insert("order_id".into(), json!("o-1"));
        CommandEnvelope::new(
            "reserve_inventory",
            payload,
            CorrelationId::new(),
            Some(SagaId::new()),
            "coordinator_replies_abcd1234",
            "saga_coordinator",
        )
    }

    #[test]
    fn test_topic_names() {
        assert_eq!(command_topic("inventory"), "inventory_commands");
        assert_eq!(domain_event_topic("order"), "order_domain_events");
    }

    #[test]
    fn test_command_wire_shape() {
        let command = sample_command();
        let json = serde_json::to_value(&command).unwrap();

        assert_eq!(json["command"], "reserve_inventory");
        assert_eq!(json["command_type"], "saga_command");
        assert_eq!(json["reply_topic"], "coordinator_replies_abcd1234");
        assert_eq!(json["source_service"], "saga_coordinator");
        assert_eq!(json["correlation_id"], command.correlation_id.to_string());
        assert!(json["timestamp"].is_f64());
    }

    #[test]
    fn test_success_reply_copies_routing_fields() {
        let command = sample_command();
        let reply = ReplyEnvelope::success(&command, "inventory", Payload::new());

        assert_eq!(reply.correlation_id, Some(command.correlation_id));
        assert_eq!(reply.saga_id, command.saga_id);
        assert!(reply.is_success());

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_reply_into_result() {
        let reply = ReplyEnvelope::error(
            Some(CorrelationId::new()),
            None,
            "payment",
            Some("process_payment".to_string()),
            "Payment declined",
        );
        assert_eq!(serde_json::to_value(&reply).unwrap()["status"], "error");

        match reply.into_result() {
            Err(BusError::Remote {
                service,
                command,
                message,
            }) => {
                assert_eq!(service, "payment");
                assert_eq!(command, "process_payment");
                assert_eq!(message, "Payment declined");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_domain_event_defaults() {
        let event = DomainEventEnvelope::new(
            "order_cancelled",
            "o-1",
            "order",
            Payload::new(),
            "order",
        );
        assert_eq!(event.event_version, EVENT_VERSION);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["aggregate_id"], "o-1");
        assert_eq!(json["service_name"], "order");
        assert!(json["event_id"].is_string());
    }
}
