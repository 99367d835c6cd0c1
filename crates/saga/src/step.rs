//! A single forward/compensate pair of a saga.

use std::time::Duration;

use common::{Payload, SagaId, merged};
use event_bus::{BusError, CommandSender, command_topic};
use serde::Serialize;
use serde_json::Value;

/// One step of a saga: a command on a participant plus its undo.
#[derive(Debug, Clone)]
pub struct SagaStep {
    /// Participant service; commands go to `"<service>_commands"`.
    pub service: String,

    /// Forward command.
    pub action_command: String,

    /// Command that semantically undoes `action_command`.
    pub compensation_command: String,

    /// Base payload; the saga context is merged over it.
    pub request_template: Payload,

    /// True once the forward call returned successfully. Only executed
    /// steps are compensated.
    pub executed: bool,

    /// Result of the forward call.
    pub last_response: Option<Payload>,
}

impl SagaStep {
    /// Creates a step with an empty request template.
    pub fn new(
        service: impl Into<String>,
        action_command: impl Into<String>,
        compensation_command: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            action_command: action_command.into(),
            compensation_command: compensation_command.into(),
            request_template: Payload::new(),
            executed: false,
            last_response: None,
        }
    }

    /// Sets the request template.
    pub fn with_template(mut self, template: Payload) -> Self {
        self.request_template = template;
        self
    }

    /// Returns the topic this step's commands are sent to.
    pub fn topic(&self) -> String {
        command_topic(&self.service)
    }

    /// Returns true if compensation must be attempted for this step.
    pub fn needs_compensation(&self) -> bool {
        self.executed
    }

    /// Runs the forward command with `context` merged over the template.
    ///
    /// On success the step is marked executed and the result is kept. Any
    /// error (rejection or timeout) leaves the step unexecuted.
    pub async fn execute(
        &mut self,
        sender: &dyn CommandSender,
        context: &Payload,
        saga_id: SagaId,
        timeout: Duration,
    ) -> Result<Payload, BusError> {
        let request = merged(&self.request_template, context);
        let response = sender
            .send_command(&self.topic(), &self.action_command, request, Some(saga_id), timeout)
            .await?;
        self.executed = true;
        self.last_response = Some(response.clone());
        Ok(response)
    }

    /// Runs the compensating command with the context plus
    /// `original_response` (the forward result).
    pub async fn compensate(
        &self,
        sender: &dyn CommandSender,
        context: &Payload,
        saga_id: SagaId,
        timeout: Duration,
    ) -> Result<Payload, BusError> {
        let mut request = merged(&self.request_template, context);
        request.insert(
            "original_response".to_string(),
            Value::Object(self.last_response.clone().unwrap_or_default()),
        );
        sender
            .send_command(
                &self.topic(),
                &self.compensation_command,
                request,
                Some(saga_id),
                timeout,
            )
            .await
    }

    /// Returns the serializable view of this step.
    pub fn view(&self) -> StepView {
        StepView {
            service: self.service.clone(),
            action_command: self.action_command.clone(),
            compensation_command: self.compensation_command.clone(),
            executed: self.executed,
            last_response: self.last_response.clone(),
        }
    }
}

/// Read-only view of a step, as exposed in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub service: String,
    pub action_command: String,
    pub compensation_command: String,
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response: Option<Payload>,
}
