//! Saga orchestration for multi-service order processing.
//!
//! A [`Saga`] runs an ordered list of [`SagaStep`]s against participant
//! services through correlated commands. Results accumulate in a shared
//! context. When a step fails, the steps that ran are compensated in reverse
//! order and the saga ends `ABORTED`.
//!
//! [`OrderSaga`] wires the five order steps:
//! 1. Create order
//! 2. Reserve inventory
//! 3. Process payment
//! 4. Schedule shipping
//! 5. Send notification
//!
//! [`SagaCoordinator`] runs order sagas on behalf of the HTTP API and keeps
//! them queryable in memory.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod order_saga;
pub mod saga;
pub mod state;
pub mod step;

pub use coordinator::{CoordinatorConfig, CoordinatorStatistics, SagaCoordinator, SagaSummary};
pub use error::{Result, SagaError};
pub use events::SagaLifecycleEvent;
pub use order_saga::{OrderItem, OrderRequest, OrderSaga, OrderSagaResult};
pub use saga::{ABORTED_BY_REQUEST, AbortHandle, DEFAULT_STEP_TIMEOUT, Saga, SagaOutcome, SagaSnapshot};
pub use state::SagaStatus;
pub use step::{SagaStep, StepView};
