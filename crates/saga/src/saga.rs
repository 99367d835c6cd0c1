//! The saga orchestration engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{Payload, SagaId, merge};
use event_bus::{CommandSender, DomainEventPublisher};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{Result, SagaError};
use crate::events::{self, SagaCompletedData, SagaFailedData, SagaLifecycleEvent, SagaStartedData};
use crate::state::SagaStatus;
use crate::step::{SagaStep, StepView};

/// Default per-step reply timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Error recorded on a saga stopped through its [`AbortHandle`].
pub const ABORTED_BY_REQUEST: &str = "Saga aborted by request";

/// Requests that a running saga stop before its next step.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Asks the saga to fail at the next step boundary and compensate.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once an abort was requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of a saga, broadcast after every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaSnapshot {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub context: Payload,
    pub steps: Vec<StepView>,
    pub failed_step_index: Option<usize>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaSnapshot {
    /// Returns how many forward steps completed.
    pub fn steps_completed(&self) -> usize {
        self.steps.iter().filter(|step| step.executed).count()
    }
}

/// What `execute` hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaOutcome {
    pub status: SagaStatus,
    pub context: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
}

/// A coordinated sequence of participant commands with compensation.
///
/// Steps run strictly one after the other. The result of each step is merged
/// into the shared context before the next one runs. When a step fails,
/// every step that ran is compensated in reverse order.
pub struct Saga {
    id: SagaId,
    saga_type: String,
    steps: Vec<SagaStep>,
    context: Payload,
    status: SagaStatus,
    failed_step_index: Option<usize>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    executed: bool,
    step_timeout: Duration,
    sender: Arc<dyn CommandSender>,
    publisher: Option<Arc<dyn DomainEventPublisher>>,
    abort: AbortHandle,
    snapshots: watch::Sender<SagaSnapshot>,
}

impl Saga {
    /// Creates a saga whose context starts as `request` plus `saga_id`.
    pub fn new(sender: Arc<dyn CommandSender>, steps: Vec<SagaStep>, request: Payload) -> Self {
        let id = SagaId::new();
        let now = Utc::now();
        let mut context = request;
        context.insert("saga_id".to_string(), Value::String(id.to_string()));

        let snapshot = SagaSnapshot {
            saga_id: id,
            saga_type: "Saga".to_string(),
            status: SagaStatus::Started,
            context: context.clone(),
            steps: steps.iter().map(SagaStep::view).collect(),
            failed_step_index: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let (snapshots, _) = watch::channel(snapshot);

        Self {
            id,
            saga_type: "Saga".to_string(),
            steps,
            context,
            status: SagaStatus::Started,
            failed_step_index: None,
            error: None,
            created_at: now,
            updated_at: now,
            executed: false,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            sender,
            publisher: None,
            abort: AbortHandle::default(),
            snapshots,
        }
    }

    /// Publishes lifecycle events through `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn DomainEventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Sets the reply timeout used for every forward and compensating call.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Names the saga kind (used in events, logs and snapshots).
    pub fn with_saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = saga_type.into();
        self.publish_snapshot();
        self
    }

    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn context(&self) -> &Payload {
        &self.context
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    pub fn failed_step_index(&self) -> Option<usize> {
        self.failed_step_index
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns a handle that stops the saga before its next step.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Returns the current state as a snapshot.
    pub fn snapshot(&self) -> SagaSnapshot {
        SagaSnapshot {
            saga_id: self.id,
            saga_type: self.saga_type.clone(),
            status: self.status,
            context: self.context.clone(),
            steps: self.steps.iter().map(SagaStep::view).collect(),
            failed_step_index: self.failed_step_index,
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Subscribes to snapshots. A terminal status is only broadcast once
    /// compensation has finished.
    pub fn subscribe(&self) -> watch::Receiver<SagaSnapshot> {
        self.snapshots.subscribe()
    }

    /// Runs the steps in order.
    ///
    /// Any step failure (rejection, timeout, abort request) fails the saga at
    /// that step and runs [`compensate`](Self::compensate) before returning,
    /// so the caller sees `COMPLETED` or `ABORTED`, never a bare `FAILED`.
    /// Returns [`SagaError::InvalidState`] if the saga already ran.
    #[tracing::instrument(skip(self), fields(saga_id = %self.id, saga_type = %self.saga_type))]
    pub async fn execute(&mut self) -> Result<SagaOutcome> {
        if self.executed || self.status.is_terminal() {
            return Err(SagaError::InvalidState {
                operation: "execute",
                status: self.status,
            });
        }
        self.executed = true;

        metrics::counter!("saga_executions_total").increment(1);
        let started = Instant::now();
        tracing::info!(steps = self.steps.len(), "saga started");
        events::publish(
            self.publisher.as_ref(),
            SagaLifecycleEvent::Started(SagaStartedData {
                saga_id: self.id,
                saga_type: self.saga_type.clone(),
                step_count: self.steps.len(),
                status: self.status,
                started_at: self.created_at,
            }),
        )
        .await;

        for index in 0..self.steps.len() {
            if self.abort.is_requested() {
                tracing::warn!(step = index, "abort requested");
                self.fail(index, ABORTED_BY_REQUEST.to_string());
                return Ok(self.finish_failed(started).await);
            }

            let step = &mut self.steps[index];
            tracing::info!(step = index, service = %step.service, command = %step.action_command, "saga step started");
            match step
                .execute(self.sender.as_ref(), &self.context, self.id, self.step_timeout)
                .await
            {
                Ok(response) => {
                    merge(&mut self.context, &response);
                    self.touch();
                    self.publish_snapshot();
                }
                Err(e) => {
                    tracing::warn!(step = index, error = %e, "saga step failed");
                    self.fail(index, e.to_string());
                    return Ok(self.finish_failed(started).await);
                }
            }
        }

        self.status = SagaStatus::Completed;
        self.touch();
        self.publish_snapshot();

        let duration = started.elapsed().as_secs_f64();
        metrics::histogram!("saga_duration_seconds").record(duration);
        metrics::counter!("saga_completed").increment(1);
        tracing::info!(duration, "saga completed");

        events::publish(
            self.publisher.as_ref(),
            SagaLifecycleEvent::Completed(SagaCompletedData {
                saga_id: self.id,
                saga_type: self.saga_type.clone(),
                status: self.status,
                completed_at: self.updated_at,
            }),
        )
        .await;

        Ok(self.outcome())
    }

    /// Compensates, newest first, every step at or below the failed step (or
    /// every step, if none failed) that needs it.
    ///
    /// The status becomes `ABORTED` on entry. A failing compensation is
    /// logged and the sweep continues. Does nothing on a terminal saga.
    /// Returns how many compensations were attempted.
    #[tracing::instrument(skip(self), fields(saga_id = %self.id))]
    pub async fn compensate(&mut self) -> usize {
        if !self.status.can_compensate() {
            return 0;
        }
        self.status = SagaStatus::Aborted;
        self.touch();

        let last = self
            .failed_step_index
            .unwrap_or_else(|| self.steps.len().saturating_sub(1));
        let mut attempts = 0;
        for index in (0..self.steps.len().min(last + 1)).rev() {
            let step = &self.steps[index];
            if !step.needs_compensation() {
                continue;
            }
            attempts += 1;
            match step
                .compensate(self.sender.as_ref(), &self.context, self.id, self.step_timeout)
                .await
            {
                Ok(_) => {
                    tracing::info!(step = index, command = %step.compensation_command, "step compensated");
                }
                Err(e) => {
                    tracing::error!(
                        step = index,
                        command = %step.compensation_command,
                        error = %e,
                        "compensation failed, continuing"
                    );
                }
            }
        }

        self.touch();
        self.publish_snapshot();
        attempts
    }

    fn fail(&mut self, index: usize, error: String) {
        self.status = SagaStatus::Failed;
        self.failed_step_index = Some(index);
        self.error = Some(error);
        self.touch();
    }

    async fn finish_failed(&mut self, started: Instant) -> SagaOutcome {
        let compensated_steps = self.compensate().await;

        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("saga_aborted").increment(1);

        let failed_step = self.failed_step_index.unwrap_or_default();
        let reason = self.error.clone().unwrap_or_default();
        tracing::warn!(failed_step, %reason, compensated_steps, "saga aborted");

        events::publish(
            self.publisher.as_ref(),
            SagaLifecycleEvent::Failed(SagaFailedData {
                saga_id: self.id,
                saga_type: self.saga_type.clone(),
                status: self.status,
                failed_step,
                failed_service: self
                    .steps
                    .get(failed_step)
                    .map(|step| step.service.clone())
                    .unwrap_or_default(),
                reason,
                compensated_steps,
                failed_at: self.updated_at,
            }),
        )
        .await;

        self.outcome()
    }

    fn outcome(&self) -> SagaOutcome {
        SagaOutcome {
            status: self.status,
            context: self.context.clone(),
            error: self.error.clone(),
            failed_step: self.failed_step_index,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}
