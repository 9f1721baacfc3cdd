//! Workflow domain types.

pub mod actor;
pub mod audit;
pub mod definition;
pub mod instance;
pub mod record;

pub use actor::{Actor, RequestOrigin};
pub use audit::{AuditAction, SecurityEvent};
pub use definition::{
    DefinitionCatalog, DefinitionError, RejectionPolicy, StepConfig, WorkflowDefinition,
};
pub use instance::{Delegation, EntityKey, Escalation, EscalationTrigger, WorkflowInstance};
pub use record::{ApprovalRecord, ApprovalStatus, IntegrityKey, sanitize_comment};
