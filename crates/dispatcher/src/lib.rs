//! Command and domain event dispatch for saga participants.
//!
//! Every participating service owns one [`CommandDispatcher`]. It consumes
//! `"<service>_commands"`, runs the registered [`CommandHandler`] and turns
//! the outcome into a reply plus a `command_processed` / `command_failed`
//! domain event. It also feeds domain events from other services to the
//! registered [`EventHandler`]s.
//!
//! A failing or panicking handler never stops the consumption loop.

pub mod defaults;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod stats;

pub use dispatcher::{CommandDispatcher, DispatchOutcome, DispatcherHandle};
pub use error::HandlerError;
pub use handler::{CommandHandler, EventHandler};
pub use stats::{DispatcherStats, StatsSnapshot};
