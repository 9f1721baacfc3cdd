//! Fail-fast checks run under the row lock before anything is written.
//!
//! Each check returns the first failing gate as an [`EngineError`]; none of
//! them touch the store.

use chrono::{DateTime, Utc};

use crate::cache::IndexedApprovalView;
use crate::domain::{Actor, EscalationTrigger, StepConfig, WorkflowDefinition, WorkflowInstance};
use crate::error::{AuthorizationReason, EngineError, EngineResult};

/// How an actor is entitled to vote on a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VoteGrant {
    /// Delegator the vote counts for, when voting as a delegate.
    pub on_behalf_of: Option<String>,
}

impl VoteGrant {
    /// Actor the vote counts for.
    pub fn voter<'a>(&'a self, actor: &'a Actor) -> &'a str {
        self.on_behalf_of.as_deref().unwrap_or(&actor.id)
    }
}

fn step_config(definition: &WorkflowDefinition, step: usize) -> EngineResult<&StepConfig> {
    definition.steps.get(step).ok_or_else(|| {
        EngineError::validation(format!(
            "step {step} is out of range for '{}' ({} steps)",
            definition.name,
            definition.steps.len()
        ))
    })
}

fn require_authenticated(actor: &Actor) -> EngineResult<()> {
    if actor.authenticated {
        Ok(())
    } else {
        Err(EngineError::unauthorized(
            &actor.id,
            AuthorizationReason::NotAuthenticated,
        ))
    }
}

fn current_step(instance: &WorkflowInstance, definition: &WorkflowDefinition) -> EngineResult<usize> {
    if definition.is_terminal(&instance.current_state) {
        return Err(EngineError::validation(format!(
            "workflow for {} is already '{}'",
            instance.key, instance.current_state
        )));
    }
    definition
        .current_step_index(&instance.current_state)
        .ok_or_else(|| {
            EngineError::validation(format!(
                "workflow for {} is in unknown state '{}'",
                instance.key, instance.current_state
            ))
        })
}

/// Decide whether `actor` may vote on `step`.
///
/// Gates, in order: step bounds, authentication, self-approval, role (direct,
/// delegated or escalated), MFA, duplicate vote, workflow state.
pub(crate) fn check_vote(
    instance: &WorkflowInstance,
    definition: &WorkflowDefinition,
    view: &IndexedApprovalView,
    actor: &Actor,
    step: usize,
) -> EngineResult<VoteGrant> {
    let config = step_config(definition, step)?;
    require_authenticated(actor)?;

    if actor.id == instance.owner_id {
        return Err(EngineError::unauthorized(
            &actor.id,
            AuthorizationReason::SelfApproval,
        ));
    }

    let grant = if actor.has_role(&config.required_role) {
        if instance.has_delegated(&actor.id, step) {
            return Err(EngineError::unauthorized(
                &actor.id,
                AuthorizationReason::NotPermitted {
                    detail: format!("vote on step {step} was delegated"),
                },
            ));
        }
        VoteGrant { on_behalf_of: None }
    } else if let Some(delegation) = instance.delegation_to(&actor.id, step) {
        if delegation.from_actor == instance.owner_id {
            return Err(EngineError::unauthorized(
                &actor.id,
                AuthorizationReason::SelfApproval,
            ));
        }
        VoteGrant {
            on_behalf_of: Some(delegation.from_actor.clone()),
        }
    } else if escalation_grants(instance, config, actor, step) {
        VoteGrant { on_behalf_of: None }
    } else {
        return Err(EngineError::unauthorized(
            &actor.id,
            AuthorizationReason::MissingRole {
                required_role: config.required_role.clone(),
            },
        ));
    };

    if config.requires_mfa && !actor.mfa_verified {
        return Err(EngineError::unauthorized(
            &actor.id,
            AuthorizationReason::MfaRequired,
        ));
    }

    let voter = grant.voter(actor);
    if !config.allow_repeat_approvals && view.has_voted(step, voter) {
        return Err(EngineError::DuplicateApproval {
            actor_id: voter.to_string(),
            step,
        });
    }

    let expected = definition.expected_state_for(step);
    if instance.current_state != expected {
        return Err(EngineError::validation(format!(
            "step {step} expects state '{expected}' but workflow for {} is '{}'",
            instance.key, instance.current_state
        )));
    }

    Ok(grant)
}

fn escalation_grants(
    instance: &WorkflowInstance,
    config: &StepConfig,
    actor: &Actor,
    step: usize,
) -> bool {
    instance.is_escalated(step)
        && config
            .escalation_role
            .as_deref()
            .is_some_and(|role| actor.has_role(role))
}

/// Decide whether `actor` may hand their vote on the current step to
/// `to_actor`. Returns the step index.
pub(crate) fn check_delegation(
    instance: &WorkflowInstance,
    definition: &WorkflowDefinition,
    view: &IndexedApprovalView,
    actor: &Actor,
    step: Option<usize>,
    to_actor: &str,
) -> EngineResult<usize> {
    require_authenticated(actor)?;
    let current = current_step(instance, definition)?;
    let step = step.unwrap_or(current);
    if step != current {
        return Err(EngineError::validation(format!(
            "only the current step ({current}) can be delegated, not step {step}"
        )));
    }
    let config = step_config(definition, step)?;

    let refuse = |detail: String| {
        EngineError::unauthorized(&actor.id, AuthorizationReason::NotPermitted { detail })
    };

    if actor.id == instance.owner_id {
        return Err(EngineError::unauthorized(
            &actor.id,
            AuthorizationReason::SelfApproval,
        ));
    }
    if !actor.has_role(&config.required_role) {
        return Err(EngineError::unauthorized(
            &actor.id,
            AuthorizationReason::MissingRole {
                required_role: config.required_role.clone(),
            },
        ));
    }
    if to_actor.trim().is_empty() {
        return Err(EngineError::validation("delegate id is empty"));
    }
    if to_actor == actor.id {
        return Err(EngineError::validation("cannot delegate to yourself"));
    }
    if to_actor == instance.owner_id {
        return Err(refuse("cannot delegate to the entity owner".to_string()));
    }
    if instance.has_delegated(&actor.id, step) {
        return Err(refuse(format!("vote on step {step} already delegated")));
    }
    if view.has_voted(step, &actor.id) {
        return Err(EngineError::DuplicateApproval {
            actor_id: actor.id.clone(),
            step,
        });
    }
    Ok(step)
}

/// Decide whether `actor` may escalate the current step. Returns the step
/// index.
///
/// The entity owner may never escalate. Manual escalation needs the step's
/// role or its escalation role. Timeout and SLA triggers need no role but are
/// only accepted once the step has been open for its configured timeout.
pub(crate) fn check_escalation(
    instance: &WorkflowInstance,
    definition: &WorkflowDefinition,
    actor: &Actor,
    trigger: EscalationTrigger,
    now: DateTime<Utc>,
) -> EngineResult<usize> {
    require_authenticated(actor)?;
    let step = current_step(instance, definition)?;
    let config = step_config(definition, step)?;

    let Some(escalation_role) = config.escalation_role.as_deref() else {
        return Err(EngineError::validation(format!(
            "step '{}' has no escalation role",
            config.name
        )));
    };
    if actor.id == instance.owner_id {
        return Err(EngineError::unauthorized(
            &actor.id,
            AuthorizationReason::SelfApproval,
        ));
    }

    let refuse = |detail: String| {
        EngineError::unauthorized(&actor.id, AuthorizationReason::NotPermitted { detail })
    };
    match trigger {
        EscalationTrigger::Manual => {
            if !actor.has_role(&config.required_role) && !actor.has_role(escalation_role) {
                return Err(refuse(format!("cannot escalate step '{}'", config.name)));
            }
        }
        EscalationTrigger::Timeout | EscalationTrigger::Sla => {
            let Some(timeout) = config.timeout() else {
                return Err(refuse(format!(
                    "step '{}' has no timeout to breach",
                    config.name
                )));
            };
            let open_for = instance.time_in_state(now);
            if open_for < timeout {
                return Err(refuse(format!(
                    "step '{}' open for {}s of its {}s timeout",
                    config.name,
                    open_for.as_secs(),
                    timeout.as_secs()
                )));
            }
        }
    }

    if instance.is_escalated(step) {
        return Err(EngineError::validation(format!(
            "step {step} is already escalated"
        )));
    }
    Ok(step)
}
