//! Values returned to engine callers.

use serde::{Deserialize, Serialize};

use crate::domain::{Actor, ApprovalRecord, EntityKey};
use crate::error::{EngineError, EngineResult, ErrorKind};

/// Result of a committed vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    /// Always `true` for a returned outcome.
    pub success: bool,
    /// Record appended to the history.
    pub record: ApprovalRecord,
    /// State before the vote.
    pub previous_state: String,
    /// State after the vote.
    pub current_state: String,
    /// Whether the vote completed its step.
    pub step_completed: bool,
    /// Whether the instance reached a terminal state.
    pub workflow_completed: bool,
    /// Instance version after the write.
    pub version: u64,
}

/// One item of a bulk approval.
#[derive(Debug, Clone)]
pub struct BulkApprovalRequest {
    /// Entity to approve.
    pub key: EntityKey,
    /// Step index.
    pub step: usize,
    /// Voting actor.
    pub actor: Actor,
    /// Free-text comment.
    pub comment: String,
}

/// Caller-facing result of one action.
///
/// Carries a sanitized message only; the full error is logged where it
/// happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action committed.
    pub success: bool,
    /// Failure kind, when it failed.
    pub error_kind: Option<ErrorKind>,
    /// Safe message for display.
    pub message: String,
    /// Committed outcome, when it succeeded.
    pub outcome: Option<ApprovalOutcome>,
}

impl ActionResult {
    /// Convert an engine result.
    pub fn from_result(result: EngineResult<ApprovalOutcome>) -> Self {
        match result {
            Ok(outcome) => Self::from(outcome),
            Err(error) => Self::from(&error),
        }
    }
}

impl From<ApprovalOutcome> for ActionResult {
    fn from(outcome: ApprovalOutcome) -> Self {
        let message = if outcome.workflow_completed {
            format!("Workflow completed in state '{}'.", outcome.current_state)
        } else if outcome.step_completed {
            format!("Step completed; now '{}'.", outcome.current_state)
        } else {
            "Vote recorded.".to_string()
        };
        Self {
            success: true,
            error_kind: None,
            message,
            outcome: Some(outcome),
        }
    }
}

impl From<&EngineError> for ActionResult {
    fn from(error: &EngineError) -> Self {
        Self {
            success: false,
            error_kind: Some(error.kind()),
            message: error.user_message(),
            outcome: None,
        }
    }
}
