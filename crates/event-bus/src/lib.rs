//! Event bus client for saga orchestration.
//!
//! Wraps a publish/subscribe [`MessageBus`] and layers on top of it:
//! - correlated request/reply (`send_command`) with a per-call timeout
//! - domain event publication keyed by aggregate id
//! - one supervised reply listener per client instance

pub mod bus;
pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod memory;

pub use bus::{BusRecord, MessageBus, Subscription};
pub use client::{CommandSender, DomainEventPublisher, EventBusClient};
pub use config::BusConfig;
pub use envelope::{
    COMMAND_TYPE, COORDINATOR_SERVICE, CommandEnvelope, DomainEventEnvelope, EVENT_VERSION,
    ReplyEnvelope, ReplyStatus, SAGA_COMPLETED, SAGA_FAILED, SAGA_STARTED, command_topic,
    domain_event_topic,
};
pub use error::{BusError, Result};
pub use memory::InMemoryBus;
