//! Participant-side dispatcher: commands in, replies and domain events out.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use common::{CorrelationId, Payload, SagaId};
use event_bus::{
    BusError, COORDINATOR_SERVICE, CommandEnvelope, DomainEventEnvelope, EventBusClient,
    ReplyEnvelope, SAGA_COMPLETED, SAGA_FAILED, SAGA_STARTED, Subscription, command_topic,
    domain_event_topic,
};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::defaults::{GetStatistics, HealthCheck, SagaLifecycleLogger};
use crate::{CommandHandler, DispatcherStats, EventHandler, StatsSnapshot};

/// Event published after a handler succeeded.
pub const COMMAND_PROCESSED: &str = "command_processed";

/// Event published after a handler failed or panicked.
pub const COMMAND_FAILED: &str = "command_failed";

/// What happened to one inbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler succeeded and a success reply was sent.
    Processed,
    /// The handler returned an error or panicked; an error reply was sent.
    Failed(String),
    /// The command was malformed or unknown and never reached a handler.
    Rejected(String),
}

/// Topic that receives error replies for commands without a `reply_topic`.
pub fn rejected_commands_topic(service: &str) -> String {
    format!("{service}_rejected_commands")
}

/// Routes commands and domain events of one service to their handlers.
///
/// Handlers are registered before [`start`](Self::start). Once started, the
/// dispatcher consumes `"<service>_commands"` plus the domain event topics of
/// every service passed to [`subscribe_to`](Self::subscribe_to).
pub struct CommandDispatcher {
    client: Arc<EventBusClient>,
    commands: HashMap<String, Arc<dyn CommandHandler>>,
    events: HashMap<String, Arc<dyn EventHandler>>,
    event_sources: BTreeSet<String>,
    stats: Arc<DispatcherStats>,
}

impl CommandDispatcher {
    /// Creates a dispatcher with the default handlers registered.
    pub fn new(client: Arc<EventBusClient>) -> Self {
        let service = client.service_name().to_string();
        let stats = Arc::new(DispatcherStats::default());

        let mut dispatcher = Self {
            client: client.clone(),
            commands: HashMap::new(),
            events: HashMap::new(),
            event_sources: BTreeSet::new(),
            stats: stats.clone(),
        };

        dispatcher.register_command("health_check", HealthCheck::new(client));
        dispatcher.register_command("get_statistics", GetStatistics::new(&service, stats));

        let lifecycle = Arc::new(SagaLifecycleLogger::new(&service));
        for event_type in [SAGA_STARTED, SAGA_COMPLETED, SAGA_FAILED] {
            dispatcher
                .events
                .insert(event_type.to_string(), lifecycle.clone());
        }
        dispatcher.subscribe_to(COORDINATOR_SERVICE);

        dispatcher
    }

    /// Registers `handler` for `command`, replacing any previous one.
    pub fn register_command(&mut self, command: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.commands.insert(command.into(), Arc::new(handler));
    }

    /// Registers `handler` for domain events of `event_type`.
    pub fn register_event(&mut self, event_type: impl Into<String>, handler: impl EventHandler + 'static) {
        self.events.insert(event_type.into(), Arc::new(handler));
    }

    /// Consumes the domain events published by `service` once started.
    pub fn subscribe_to(&mut self, service: impl Into<String>) {
        self.event_sources.insert(service.into());
    }

    /// Returns the name of the service this dispatcher serves.
    pub fn service_name(&self) -> &str {
        self.client.service_name()
    }

    /// Returns the registered command names, sorted.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns true if a handler is registered for `command`.
    pub fn handles(&self, command: &str) -> bool {
        self.commands.contains_key(command)
    }

    /// Returns the current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Handles one raw inbound command message.
    ///
    /// Never fails: every outcome, including a panicking handler, is turned
    /// into a reply. Publish errors while replying are logged.
    #[tracing::instrument(skip(self, raw), fields(service = %self.service_name(), command))]
    pub async fn handle_command(&self, raw: Value) -> DispatchOutcome {
        let command = match parse_command(raw) {
            Ok(command) => command,
            Err(invalid) => {
                let reason = invalid.reason();
                tracing::warn!(%reason, "malformed command");
                self.stats.record_rejected();
                self.count_command(invalid.command.as_deref().unwrap_or("unknown"), "rejected");

                let destination = invalid
                    .reply_topic
                    .clone()
                    .unwrap_or_else(|| rejected_commands_topic(self.service_name()));
                let reply = ReplyEnvelope::error(
                    invalid.correlation_id,
                    invalid.saga_id,
                    self.service_name(),
                    invalid.command,
                    &reason,
                );
                self.send_reply(&destination, &reply).await;
                return DispatchOutcome::Rejected(reason);
            }
        };
        tracing::Span::current().record("command", command.command.as_str());

        let Some(handler) = self.commands.get(&command.command).cloned() else {
            let reason = format!("Unknown command: {}", command.command);
            tracing::warn!(%reason, "no handler registered");
            self.stats.record_rejected();
            self.count_command(&command.command, "rejected");

            let reply = ReplyEnvelope::error(
                Some(command.correlation_id),
                command.saga_id,
                self.service_name(),
                Some(command.command.clone()),
                &reason,
            );
            self.send_reply(&command.reply_topic, &reply).await;
            return DispatchOutcome::Rejected(reason);
        };

        let result = AssertUnwindSafe(handler.handle(command.payload.clone(), &command))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(payload)) => {
                self.stats.record_processed();
                self.count_command(&command.command, "processed");
                tracing::debug!("command processed");

                let reply = ReplyEnvelope::success(&command, self.service_name(), payload.clone());
                self.send_reply(&command.reply_topic, &reply).await;

                let mut event_data = audit_fields(&command);
                event_data.insert("result".into(), Value::Object(payload));
                self.publish_audit_event(COMMAND_PROCESSED, &command, event_data)
                    .await;
                return DispatchOutcome::Processed;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("Handler panicked: {}", panic_message(panic.as_ref())),
        };

        tracing::warn!(error = %failure, "command failed");
        self.stats.record_failed();
        self.count_command(&command.command, "failed");

        let reply = ReplyEnvelope::error(
            Some(command.correlation_id),
            command.saga_id,
            self.service_name(),
            Some(command.command.clone()),
            &failure,
        );
        self.send_reply(&command.reply_topic, &reply).await;

        let mut event_data = audit_fields(&command);
        event_data.insert("error".into(), Value::from(failure.as_str()));
        self.publish_audit_event(COMMAND_FAILED, &command, event_data)
            .await;

        DispatchOutcome::Failed(failure)
    }

    /// Handles one raw domain event message.
    ///
    /// Returns true if a handler ran successfully. Unknown event types are
    /// ignored; handler errors and panics are logged.
    #[tracing::instrument(skip(self, raw), fields(service = %self.service_name()))]
    pub async fn handle_domain_event(&self, raw: Value) -> bool {
        let event: DomainEventEnvelope = match serde_json::from_value(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed domain event");
                self.stats.record_event_ignored();
                return false;
            }
        };

        let Some(handler) = self.events.get(&event.event_type).cloned() else {
            tracing::debug!(event_type = %event.event_type, "no handler for event type");
            self.stats.record_event_ignored();
            return false;
        };

        match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
            Ok(Ok(())) => {
                self.stats.record_event_handled();
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(event_type = %event.event_type, error = %e, "event handler failed");
                self.stats.record_event_ignored();
                false
            }
            Err(panic) => {
                tracing::warn!(
                    event_type = %event.event_type,
                    panic = %panic_message(panic.as_ref()),
                    "event handler panicked"
                );
                self.stats.record_event_ignored();
                false
            }
        }
    }

    /// Subscribes to the command topic and every event source, then spawns
    /// the consumption loops.
    ///
    /// Commands are handled concurrently. Domain events of one topic are
    /// handled in delivery order.
    pub async fn start(self: Arc<Self>) -> Result<DispatcherHandle, BusError> {
        let service = self.service_name().to_string();
        let bus = self.client.bus();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let commands = bus.subscribe(&command_topic(&service), &service).await?;
        let mut event_subscriptions = Vec::with_capacity(self.event_sources.len());
        for source in &self.event_sources {
            event_subscriptions.push(bus.subscribe(&domain_event_topic(source), &service).await?);
        }

        let mut tasks = Vec::with_capacity(event_subscriptions.len() + 1);
        tasks.push(tokio::spawn(
            self.clone().consume_commands(commands, shutdown_rx.clone()),
        ));
        for subscription in event_subscriptions {
            tasks.push(tokio::spawn(
                self.clone().consume_events(subscription, shutdown_rx.clone()),
            ));
        }

        tracing::info!(
            %service,
            commands = self.commands.len(),
            event_sources = self.event_sources.len(),
            "dispatcher started"
        );

        Ok(DispatcherHandle {
            dispatcher: self,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    async fn consume_commands(self: Arc<Self>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                record = subscription.recv() => match record {
                    Some(record) => {
                        let dispatcher = self.clone();
                        tokio::spawn(async move {
                            dispatcher.handle_command(record.payload).await;
                        });
                    }
                    None => {
                        tracing::warn!(topic = %subscription.topic(), "command subscription closed");
                        break;
                    }
                },
            }
        }
    }

    async fn consume_events(self: Arc<Self>, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                record = subscription.recv() => match record {
                    Some(record) => {
                        self.handle_domain_event(record.payload).await;
                    }
                    None => {
                        tracing::warn!(topic = %subscription.topic(), "event subscription closed");
                        break;
                    }
                },
            }
        }
    }

    async fn send_reply(&self, topic: &str, reply: &ReplyEnvelope) {
        let key = reply.correlation_id.map(|id| id.to_string());
        if let Err(e) = self.client.publish(topic, key.as_deref(), reply).await {
            tracing::error!(%topic, error = %e, "failed to publish reply");
        }
    }

    async fn publish_audit_event(&self, event_type: &str, command: &CommandEnvelope, event_data: Payload) {
        let aggregate_id = command
            .saga_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| command.correlation_id.to_string());
        if let Err(e) = self
            .client
            .publish_domain_event(event_type, &aggregate_id, "command", event_data)
            .await
        {
            tracing::error!(%event_type, error = %e, "failed to publish command event");
        }
    }

    fn count_command(&self, command: &str, outcome: &'static str) {
        metrics::counter!(
            "dispatcher_commands_total",
            "service" => self.service_name().to_string(),
            "command" => command.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Handle to a started dispatcher.
pub struct DispatcherHandle {
    dispatcher: Arc<CommandDispatcher>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Returns the running dispatcher.
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Returns the current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats()
    }

    /// Stops the consumption loops and waits for them to exit. Dropping the
    /// handle also stops them.
    ///
    /// Commands already being handled run to completion in the background.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "dispatcher loop ended abnormally");
            }
        }
        tracing::info!(service = %self.dispatcher.service_name(), "dispatcher stopped");
    }
}

/// Routing fields salvaged from a command that failed validation.
#[derive(Debug, Default)]
struct InvalidCommand {
    command: Option<String>,
    reply_topic: Option<String>,
    correlation_id: Option<CorrelationId>,
    saga_id: Option<SagaId>,
    missing: Vec<&'static str>,
    malformed: Vec<&'static str>,
}

impl InvalidCommand {
    fn reason(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("Missing required fields: {}", self.missing.join(", ")));
        }
        if !self.malformed.is_empty() {
            parts.push(format!("Malformed fields: {}", self.malformed.join(", ")));
        }
        if parts.is_empty() {
            "Command must be a JSON object".to_string()
        } else {
            parts.join("; ")
        }
    }
}

fn parse_command(raw: Value) -> Result<CommandEnvelope, InvalidCommand> {
    let Value::Object(mut fields) = raw else {
        return Err(InvalidCommand::default());
    };

    let mut invalid = InvalidCommand::default();

    invalid.command = string_field(&fields, "command");
    if invalid.command.is_none() {
        invalid.missing.push("command");
    }
    invalid.reply_topic = string_field(&fields, "reply_topic");
    if invalid.reply_topic.is_none() {
        invalid.missing.push("reply_topic");
    }
    match string_field(&fields, "correlation_id") {
        Some(id) => match id.parse() {
            Ok(id) => invalid.correlation_id = Some(id),
            Err(_) => invalid.malformed.push("correlation_id"),
        },
        None => invalid.missing.push("correlation_id"),
    }
    invalid.saga_id = string_field(&fields, "saga_id").and_then(|id| id.parse().ok());

    let payload = match fields.remove("payload") {
        Some(Value::Object(payload)) => payload,
        None | Some(Value::Null) => Payload::new(),
        Some(_) => {
            invalid.malformed.push("payload");
            Payload::new()
        }
    };

    match (invalid.command.take(), invalid.reply_topic.take(), invalid.correlation_id) {
        (Some(command), Some(reply_topic), Some(correlation_id)) if invalid.malformed.is_empty() => {
            let source = string_field(&fields, "source_service").unwrap_or_else(|| "unknown".to_string());
            let mut envelope = CommandEnvelope::new(
                command,
                payload,
                correlation_id,
                invalid.saga_id,
                reply_topic,
                source,
            );
            if let Some(timestamp) = fields.get("timestamp").and_then(Value::as_f64) {
                envelope.timestamp = timestamp;
            }
            Ok(envelope)
        }
        (command, reply_topic, _) => {
            invalid.command = command;
            invalid.reply_topic = reply_topic;
            Err(invalid)
        }
    }
}

fn string_field(fields: &Payload, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn audit_fields(command: &CommandEnvelope) -> Payload {
    let mut data = Payload::new();
    data.insert("command".into(), Value::from(command.command.as_str()));
    data.insert(
        "correlation_id".into(),
        Value::from(command.correlation_id.to_string()),
    );
    data.insert(
        "saga_id".into(),
        command
            .saga_id
            .map(|id| Value::from(id.to_string()))
            .unwrap_or(Value::Null),
    );
    data
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
