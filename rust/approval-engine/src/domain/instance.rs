//! Mutable approval state attached to one business entity.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::WorkflowDefinition;
use super::record::{ApprovalRecord, ApprovalStatus};

/// Identifies the business entity a workflow is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Kind of record (e.g. `invoice`).
    pub entity_type: String,
    /// Identifier within that kind.
    pub entity_id: String,
}

impl EntityKey {
    /// Create a key.
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// A vote handed from one actor to another for a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    /// Step the delegation applies to.
    pub step: usize,
    /// Actor giving up their vote.
    pub from_actor: String,
    /// Actor receiving it.
    pub to_actor: String,
    /// Justification.
    pub reason: String,
    /// When it was granted.
    pub at: DateTime<Utc>,
}

/// Why a step was escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    /// Raised by an actor.
    Manual,
    /// Raised because the step is about to time out.
    Timeout,
    /// Raised by an external SLA monitor.
    Sla,
}

impl EscalationTrigger {
    /// Storage string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Timeout => "timeout",
            Self::Sla => "sla",
        }
    }
}

/// Record of a step escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    /// Escalated step.
    pub step: usize,
    /// Actor who escalated.
    pub actor_id: String,
    /// Justification.
    pub reason: String,
    /// What raised it.
    pub trigger: EscalationTrigger,
    /// When.
    pub at: DateTime<Utc>,
}

/// Approval state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Instance identifier.
    pub id: Uuid,
    /// Entity under approval.
    pub key: EntityKey,
    /// Creator of the entity; barred from approving it.
    pub owner_id: String,
    /// Name of the definition driving this instance.
    pub definition: String,
    /// Current state label.
    pub current_state: String,
    /// Append-only vote history.
    pub approval_history: Vec<ApprovalRecord>,
    /// Optimistic-locking counter; 1 on creation, +1 per persisted change.
    pub version: u64,
    /// Creation time.
    pub started_at: DateTime<Utc>,
    /// Set once a terminal state is reached.
    pub completed_at: Option<DateTime<Utc>>,
    /// When `current_state` was entered; drives step timeouts.
    pub state_entered_at: DateTime<Utc>,
    /// Active vote delegations.
    #[serde(default)]
    pub delegations: Vec<Delegation>,
    /// Step escalations.
    #[serde(default)]
    pub escalations: Vec<Escalation>,
}

impl WorkflowInstance {
    /// Create a fresh instance at the definition's initial state.
    pub fn new(key: EntityKey, owner_id: impl Into<String>, definition: &WorkflowDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key,
            owner_id: owner_id.into(),
            definition: definition.name.clone(),
            current_state: definition.initial_state.clone(),
            approval_history: Vec::new(),
            version: 1,
            started_at: now,
            completed_at: None,
            state_entered_at: now,
            delegations: Vec::new(),
            escalations: Vec::new(),
        }
    }

    /// Move to `state`, stamping completion when it is terminal.
    pub fn transition_to(&mut self, state: String, definition: &WorkflowDefinition, at: DateTime<Utc>) {
        if state == self.current_state {
            return;
        }
        if definition.is_terminal(&state) {
            self.completed_at = Some(at);
        }
        self.current_state = state;
        self.state_entered_at = at;
    }

    /// Delegation granting `actor_id` a vote on `step`, if any.
    #[must_use]
    pub fn delegation_to(&self, actor_id: &str, step: usize) -> Option<&Delegation> {
        self.delegations
            .iter()
            .rev()
            .find(|d| d.step == step && d.to_actor == actor_id)
    }

    /// Whether `actor_id` already handed their vote on `step` to someone.
    #[must_use]
    pub fn has_delegated(&self, actor_id: &str, step: usize) -> bool {
        self.delegations
            .iter()
            .any(|d| d.step == step && d.from_actor == actor_id)
    }

    /// Whether `step` has been escalated.
    #[must_use]
    pub fn is_escalated(&self, step: usize) -> bool {
        self.escalations.iter().any(|e| e.step == step)
    }

    /// Time spent in the current state as of `now`; zero when `now` is
    /// earlier than the last transition.
    #[must_use]
    pub fn time_in_state(&self, now: DateTime<Utc>) -> Duration {
        (now - self.state_entered_at).to_std().unwrap_or_default()
    }

    /// Approved votes on `step`, counted by scanning the history.
    ///
    /// Reference implementation for the indexed view; the engine itself reads
    /// counts from the cache.
    #[must_use]
    pub fn approved_count(&self, step: usize) -> usize {
        self.approval_history
            .iter()
            .filter(|r| r.step == step && r.status == ApprovalStatus::Approved)
            .count()
    }
}
