//! Workflow execution state machine
//!
//! An execution progresses through:
//! STARTED → EXTRACTING → (EXTRACTION_FAILED | BRANCHES_RUNNING) →
//! AGGREGATING → (COMPLETED | FAILED)
//!
//! The execution record is owned exclusively by the orchestrator and
//! persisted on every transition, so multiple engine instances can
//! operate over the same durable state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Admitted by the idempotency guard, not yet running
    Started,
    /// Vision feature extraction in progress
    Extracting,
    /// Extraction failed permanently; no branch work was started
    ExtractionFailed,
    /// Pricing and authenticity branches running concurrently
    BranchesRunning,
    /// Both branches terminal; aggregation in progress
    Aggregating,
    /// Aggregated record persisted and completion event published
    Completed,
    /// Terminal failure (extraction, both branches, or aggregation)
    Failed,
}

impl WorkflowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Completed | WorkflowState::Failed)
    }
}

/// State transition record (for logging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub execution_id: Uuid,
    pub old_state: WorkflowState,
    pub new_state: WorkflowState,
    pub transitioned_at: DateTime<Utc>,
}

/// Per-step attempt counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepAttempts {
    pub extraction: u32,
    pub pricing: u32,
    pub authenticity: u32,
    pub aggregation: u32,
}

/// One workflow execution (in-memory state, persisted per transition)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Unique execution identifier (allocated at admission)
    pub execution_id: Uuid,

    /// Card this execution appraises
    pub card_id: String,

    /// Image reference handed to the vision adapter
    pub image_ref: String,

    /// Bypass the pricing cache for this execution
    pub force_refresh: bool,

    /// Current workflow state
    pub state: WorkflowState,

    /// Step currently running (None once terminal)
    pub current_step: Option<String>,

    /// Attempts consumed per step
    pub attempts: StepAttempts,

    /// Last captured error, if any
    pub last_error: Option<String>,

    /// Execution start time
    pub started_at: DateTime<Utc>,

    /// Last transition time
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(execution_id: Uuid, card_id: String, image_ref: String, force_refresh: bool) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            card_id,
            image_ref,
            force_refresh,
            state: WorkflowState::Started,
            current_step: None,
            attempts: StepAttempts::default(),
            last_error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new state
    pub fn transition_to(&mut self, new_state: WorkflowState) -> StateTransition {
        let transition = StateTransition {
            execution_id: self.execution_id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        tracing::debug!(
            execution_id = %self.execution_id,
            old_state = ?transition.old_state,
            new_state = ?transition.new_state,
            "Workflow state transition"
        );
        self.state = new_state;
        self.updated_at = transition.transitioned_at;
        if new_state.is_terminal() {
            self.current_step = None;
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_execution_starts_in_started() {
        let exec = WorkflowExecution::new(Uuid::new_v4(), "c1".into(), "img1".into(), false);
        assert_eq!(exec.state, WorkflowState::Started);
        assert!(exec.last_error.is_none());
        assert_eq!(exec.attempts.extraction, 0);
    }

    #[test]
    fn test_transition_updates_state_and_timestamp() {
        let mut exec = WorkflowExecution::new(Uuid::new_v4(), "c1".into(), "img1".into(), false);
        let before = exec.updated_at;
        let t = exec.transition_to(WorkflowState::Extracting);
        assert_eq!(t.old_state, WorkflowState::Started);
        assert_eq!(exec.state, WorkflowState::Extracting);
        assert!(exec.updated_at >= before);
    }

    #[test]
    fn test_terminal_state_clears_current_step() {
        let mut exec = WorkflowExecution::new(Uuid::new_v4(), "c1".into(), "img1".into(), false);
        exec.current_step = Some("aggregating".to_string());
        exec.transition_to(WorkflowState::Completed);
        assert!(exec.current_step.is_none());
        assert!(exec.state.is_terminal());
    }
}
