//! Saga status state machine.

use serde::{Deserialize, Serialize};

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// STARTED ──┬──► COMPLETED
///           └──► FAILED ──► ABORTED
/// ```
/// `COMPLETED` and `ABORTED` are terminal; a terminal saga never resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Steps are being executed.
    #[default]
    Started,

    /// A step failed; compensation is about to run.
    Failed,

    /// All steps completed successfully (terminal state).
    Completed,

    /// Compensation ran after a failure (terminal state).
    Aborted,
}

impl SagaStatus {
    /// Returns true if compensation may still be entered.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Started | SagaStatus::Failed)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Aborted)
    }

    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "STARTED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
