//! Handler traits participants implement.

use async_trait::async_trait;
use common::Payload;
use event_bus::{CommandEnvelope, DomainEventEnvelope};

use crate::HandlerError;

/// Handles one named command.
///
/// Register one handler object per command name on a
/// [`CommandDispatcher`](crate::CommandDispatcher).
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Runs the command. The returned payload becomes the success reply.
    async fn handle(
        &self,
        payload: Payload,
        command: &CommandEnvelope,
    ) -> Result<Payload, HandlerError>;
}

/// Reacts to one domain event type for its side effects.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles the event. Errors are logged by the dispatcher and otherwise ignored.
    async fn handle(&self, event: &DomainEventEnvelope) -> Result<(), HandlerError>;
}
