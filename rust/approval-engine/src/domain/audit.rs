//! Append-only security events written alongside state changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instance::EntityKey;

/// Action recorded by a security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Workflow attached to an entity.
    WorkflowCreated,
    /// Approval vote recorded.
    Approved,
    /// Rejection vote recorded.
    Rejected,
    /// Vote delegated to another actor.
    Delegated,
    /// Step escalated.
    Escalated,
    /// Step timed out.
    TimedOut,
}

impl AuditAction {
    /// Convert action to its storage string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowCreated => "workflow_created",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Delegated => "delegated",
            Self::Escalated => "escalated",
            Self::TimedOut => "timed_out",
        }
    }
}

/// One audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Event identifier.
    pub id: Uuid,
    /// Entity the event concerns.
    pub entity: EntityKey,
    /// What happened.
    pub action: AuditAction,
    /// Who did it (`system` for sweeps).
    pub actor_id: String,
    /// Step involved, if any.
    pub step: Option<usize>,
    /// State before the action.
    pub from_state: String,
    /// State after the action.
    pub to_state: String,
    /// Free-form detail (comment, delegate, trigger).
    pub detail: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

impl SecurityEvent {
    /// Create an event stamped now.
    pub fn new(
        entity: EntityKey,
        action: AuditAction,
        actor_id: impl Into<String>,
        step: Option<usize>,
        transition: (&str, &str),
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            action,
            actor_id: actor_id.into(),
            step,
            from_state: transition.0.to_string(),
            to_state: transition.1.to_string(),
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}
