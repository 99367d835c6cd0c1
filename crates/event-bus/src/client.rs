//! Event bus client: correlated commands, domain events and reply routing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{CorrelationId, EventId, Payload, SagaId, epoch_seconds};
use serde::Serialize;
use serde_json::Value;

use crate::listener::{ListenerSettings, PendingReplies, ReplyListener, SlotError};
use crate::{
    BusConfig, BusError, BusRecord, CommandEnvelope, DomainEventEnvelope, MessageBus, Result,
    domain_event_topic,
};

/// Sends a command and waits for its correlated reply.
///
/// This is the only suspension point of the saga engine.
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// Publishes `command` to `topic` and waits up to `timeout` for the reply payload.
    async fn send_command(
        &self,
        topic: &str,
        command: &str,
        payload: Payload,
        saga_id: Option<SagaId>,
        timeout: Duration,
    ) -> Result<Payload>;
}

/// Publishes domain events on behalf of a service.
#[async_trait]
pub trait DomainEventPublisher: Send + Sync {
    /// Publishes an event about `aggregate_id`, keyed by it.
    async fn publish_domain_event(
        &self,
        event_type: &str,
        aggregate_id: &str,
        aggregate_type: &str,
        event_data: Payload,
    ) -> Result<DomainEventEnvelope>;
}

/// One service's connection to the bus.
///
/// Every instance owns a dedicated reply topic, a pending-reply table keyed by
/// correlation id and one supervised listener draining that topic. It is safe
/// to share one client between many concurrently running sagas.
pub struct EventBusClient {
    bus: Arc<dyn MessageBus>,
    config: BusConfig,
    reply_topic: String,
    pending: PendingReplies,
    listener: ReplyListener,
    closed: AtomicBool,
}

impl EventBusClient {
    /// Connects to `bus`, derives the reply topic and starts the reply listener.
    #[tracing::instrument(skip(bus, config), fields(service = %config.service_name))]
    pub async fn connect(bus: Arc<dyn MessageBus>, config: BusConfig) -> Result<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let reply_topic = format!("{}_replies_{}", config.group_id(), &suffix[..8]);
        let pending = PendingReplies::default();

        let listener = ReplyListener::start(
            bus.clone(),
            ListenerSettings {
                topic: reply_topic.clone(),
                group: config.group_id().to_string(),
                max_restarts: config.listener_max_restarts,
                backoff: config.listener_restart_backoff,
            },
            pending.clone(),
        )
        .await?;

        Ok(Self {
            bus,
            config,
            reply_topic,
            pending,
            listener,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the service name stamped on outgoing messages.
    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Returns this client's dedicated reply topic.
    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Returns the underlying bus.
    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    /// Returns the number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if a caller is still waiting on `correlation_id`.
    pub fn has_pending(&self, correlation_id: CorrelationId) -> bool {
        self.pending.contains(correlation_id)
    }

    /// Returns false after shutdown or once the reply listener gave up.
    pub fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.listener.is_healthy()
    }

    /// Returns how many times the reply listener was resubscribed.
    pub fn listener_restarts(&self) -> u32 {
        self.listener.restart_count()
    }

    /// Sends a command and waits for its reply.
    ///
    /// Each call gets a fresh correlation id. There is no retry: a timeout or
    /// an error reply is returned to the caller as is. Fails at once when the
    /// reply listener is down.
    #[tracing::instrument(skip(self, payload), fields(correlation_id))]
    pub async fn send_command(
        &self,
        topic: &str,
        command: &str,
        payload: Payload,
        saga_id: Option<SagaId>,
        timeout: Duration,
    ) -> Result<Payload> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::ClientShutdown);
        }
        if !self.listener.is_healthy() {
            return Err(BusError::ListenerUnhealthy(self.reply_topic.clone()));
        }

        let correlation_id = CorrelationId::new();
        tracing::Span::current().record("correlation_id", tracing::field::display(correlation_id));

        let envelope = CommandEnvelope::new(
            command,
            payload,
            correlation_id,
            saga_id,
            &self.reply_topic,
            &self.config.service_name,
        );
        let message = serde_json::to_value(&envelope)?;
        let key = saga_id.map(|id| id.to_string());

        let slot = self.pending.register(correlation_id);
        // On error the slot is dropped here, which frees it.
        self.bus.publish(topic, key.as_deref(), message).await?;
        metrics::counter!("bus_commands_sent_total").increment(1);
        tracing::debug!(%topic, "command published, waiting for reply");

        match slot.wait(timeout).await {
            Ok(reply) => reply.into_result(),
            Err(SlotError::TimedOut) => {
                metrics::counter!("bus_command_timeouts_total").increment(1);
                tracing::warn!(%topic, ?timeout, "command timed out");
                Err(BusError::Timeout {
                    command: command.to_string(),
                    correlation_id,
                    timeout,
                })
            }
            Err(SlotError::Closed) => Err(BusError::ClientShutdown),
        }
    }

    /// Sends a command with the configured default timeout.
    pub async fn send_command_default(
        &self,
        topic: &str,
        command: &str,
        payload: Payload,
        saga_id: Option<SagaId>,
    ) -> Result<Payload> {
        self.send_command(topic, command, payload, saga_id, self.config.default_timeout)
            .await
    }

    /// Publishes a domain event to `"<service>_domain_events"`, keyed by aggregate id.
    ///
    /// Publish failures propagate to the caller.
    #[tracing::instrument(skip(self, event_data))]
    pub async fn publish_domain_event(
        &self,
        event_type: &str,
        aggregate_id: &str,
        aggregate_type: &str,
        event_data: Payload,
    ) -> Result<DomainEventEnvelope> {
        let event = DomainEventEnvelope::new(
            event_type,
            aggregate_id,
            aggregate_type,
            event_data,
            &self.config.service_name,
        );
        let topic = domain_event_topic(&self.config.service_name);
        self.publish(&topic, Some(aggregate_id), &event).await?;
        Ok(event)
    }

    /// Publishes any serializable message as is.
    pub async fn publish<T: Serialize + Sync>(
        &self,
        topic: &str,
        key: Option<&str>,
        message: &T,
    ) -> Result<BusRecord> {
        let value = serde_json::to_value(message)?;
        self.bus.publish(topic, key, value).await
    }

    /// Publishes a JSON object after adding `event_id`, `service_name` and
    /// `timestamp` where they are missing.
    pub async fn publish_enriched(
        &self,
        topic: &str,
        key: Option<&str>,
        mut message: Value,
    ) -> Result<BusRecord> {
        let Value::Object(fields) = &mut message else {
            return Err(BusError::InvalidEnvelope(
                "only JSON objects can be enriched".to_string(),
            ));
        };
        fields
            .entry("event_id")
            .or_insert_with(|| Value::String(EventId::new().to_string()));
        fields
            .entry("service_name")
            .or_insert_with(|| Value::String(self.config.service_name.clone()));
        fields
            .entry("timestamp")
            .or_insert_with(|| Value::from(epoch_seconds()));
        self.bus.publish(topic, key, message).await
    }

    /// Stops the reply listener and fails every call still waiting.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listener.shutdown().await;
        let abandoned = self.pending.close_all();
        tracing::info!(
            service = %self.config.service_name,
            abandoned,
            "event bus client shut down"
        );
    }
}

#[async_trait]
impl CommandSender for EventBusClient {
    async fn send_command(
        &self,
        topic: &str,
        command: &str,
        payload: Payload,
        saga_id: Option<SagaId>,
        timeout: Duration,
    ) -> Result<Payload> {
        EventBusClient::send_command(self, topic, command, payload, saga_id, timeout).await
    }
}

#[async_trait]
impl DomainEventPublisher for EventBusClient {
    async fn publish_domain_event(
        &self,
        event_type: &str,
        aggregate_id: &str,
        aggregate_type: &str,
        event_data: Payload,
    ) -> Result<DomainEventEnvelope> {
        EventBusClient::publish_domain_event(self, event_type, aggregate_id, aggregate_type, event_data)
            .await
    }
}
