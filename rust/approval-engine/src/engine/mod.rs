//! Workflow engine: the entry point for every approval action.
//!
//! A vote goes through admission control first, then one transaction that
//! locks the instance row, reads the indexed view of its history, runs the
//! gates in [`gates`], appends the record, advances the state when the step
//! is satisfied, bumps the version and writes the row and its audit event.
//! The cached view is invalidated once the transaction finishes.
//!
//! Delegation and escalation do not need the row lock; they go through
//! [`TransactionCoordinator::execute_with_optimistic_locking`] against a
//! snapshot.

mod gates;
mod outcome;

pub use outcome::{ActionResult, ApprovalOutcome, BulkApprovalRequest};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::cache::{ApprovalIndexCache, IndexedApprovalView};
use crate::config::EngineConfig;
use crate::domain::{
    Actor, ApprovalRecord, ApprovalStatus, AuditAction, DefinitionCatalog, Delegation, EntityKey,
    Escalation, EscalationTrigger, IntegrityKey, RejectionPolicy, SecurityEvent, StepConfig,
    WorkflowDefinition, WorkflowInstance, sanitize_comment,
};
use crate::error::{EngineError, EngineResult};
use crate::logging::OpTimer;
use crate::rate_limit::RateLimiter;
use crate::store::{ConnectionFactory, StoreConnection, StoreErrorKind};
use crate::transaction::{FailureClass, TransactionCoordinator, TxOp, TxOptions, tx_op};

const SYSTEM_ACTOR: &str = "system";

/// Engine-wide settings taken from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Key sealing approval records.
    pub integrity_key: IntegrityKey,
    /// Comment length bound after sanitization.
    pub max_comment_length: usize,
    /// Write a security event with every state change.
    pub audit_enabled: bool,
    /// Default chunk size for bulk approvals.
    pub bulk_chunk_size: usize,
}

impl EngineSettings {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        let integrity_key = match config.security.integrity_secret.as_deref() {
            Some(secret) if !secret.is_empty() => IntegrityKey::derive(secret),
            _ => {
                tracing::warn!("No integrity secret configured; approval records use an unkeyed seal");
                IntegrityKey::unconfigured()
            }
        };
        Self {
            integrity_key,
            max_comment_length: config.security.max_comment_length,
            audit_enabled: config.security.audit_enabled,
            bulk_chunk_size: config.transaction.bulk_chunk_size,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            integrity_key: IntegrityKey::unconfigured(),
            max_comment_length: 1_000,
            audit_enabled: true,
            bulk_chunk_size: 50,
        }
    }
}

/// Orchestrates approval actions over the store.
pub struct WorkflowEngine<F: ConnectionFactory> {
    coordinator: Arc<TransactionCoordinator<F>>,
    limiter: RateLimiter,
    cache: Arc<ApprovalIndexCache>,
    catalog: Arc<DefinitionCatalog>,
    settings: Arc<EngineSettings>,
}

impl<F: ConnectionFactory> Clone for WorkflowEngine<F> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            limiter: self.limiter.clone(),
            cache: Arc::clone(&self.cache),
            catalog: Arc::clone(&self.catalog),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for WorkflowEngine<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("coordinator", &self.coordinator)
            .field("limiter", &self.limiter)
            .field("workflows", &self.catalog.names())
            .finish_non_exhaustive()
    }
}

struct VoteContext {
    key: EntityKey,
    step: usize,
    actor: Actor,
    status: ApprovalStatus,
    comment: String,
    catalog: Arc<DefinitionCatalog>,
    cache: Arc<ApprovalIndexCache>,
    settings: Arc<EngineSettings>,
}

impl<F: ConnectionFactory> WorkflowEngine<F> {
    /// Assemble an engine from its components.
    pub fn new(
        coordinator: Arc<TransactionCoordinator<F>>,
        limiter: RateLimiter,
        cache: Arc<ApprovalIndexCache>,
        catalog: Arc<DefinitionCatalog>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            coordinator,
            limiter,
            cache,
            catalog,
            settings: Arc::new(settings),
        }
    }

    /// Transaction coordinator.
    pub fn coordinator(&self) -> &TransactionCoordinator<F> {
        &self.coordinator
    }

    /// Rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Approval index cache.
    pub fn cache(&self) -> &ApprovalIndexCache {
        &self.cache
    }

    /// Definition catalog.
    pub fn catalog(&self) -> &DefinitionCatalog {
        &self.catalog
    }

    /// Attach a workflow to `key` at the definition's initial state.
    ///
    /// Fails with a validation error when `key` already has one.
    pub async fn create_workflow(
        &self,
        key: &EntityKey,
        owner_id: &str,
        definition_name: &str,
    ) -> EngineResult<WorkflowInstance> {
        let definition = self
            .catalog
            .get(definition_name)
            .ok_or_else(|| EngineError::NotFound(format!("workflow definition '{definition_name}'")))?;
        if owner_id.trim().is_empty() {
            return Err(EngineError::validation("owner id is empty"));
        }

        let instance = WorkflowInstance::new(key.clone(), owner_id, &definition);
        let audit = self.settings.audit_enabled;
        let options = TxOptions::new("create_workflow").with_entity(key.to_string());

        let created = self
            .coordinator
            .run(&options, move |conn| {
                Box::pin(insert_instance(conn, instance.clone(), audit))
            })
            .await?;

        tracing::info!(
            entity = %key,
            workflow = %definition.name,
            instance_id = %created.id,
            state = %created.current_state,
            "Workflow created"
        );
        Ok(created)
    }

    /// Approve `step` of the workflow on `key`.
    pub async fn approve(
        &self,
        key: &EntityKey,
        actor: &Actor,
        step: usize,
        comment: &str,
    ) -> EngineResult<ApprovalOutcome> {
        let comment = sanitize_comment(comment, self.settings.max_comment_length);
        self.vote(key, actor, step, ApprovalStatus::Approved, comment)
            .await
    }

    /// Reject `step` of the workflow on `key`. A reason is required.
    ///
    /// Under [`RejectionPolicy::ShortCircuit`] the workflow moves to its
    /// rejected state; under [`RejectionPolicy::RecordOnly`] the rejection is
    /// only recorded.
    pub async fn reject(
        &self,
        key: &EntityKey,
        actor: &Actor,
        step: usize,
        reason: &str,
    ) -> EngineResult<ApprovalOutcome> {
        let reason = sanitize_comment(reason, self.settings.max_comment_length);
        if reason.is_empty() {
            return Err(EngineError::validation("a rejection reason is required"));
        }
        self.vote(key, actor, step, ApprovalStatus::Rejected, reason)
            .await
    }

    async fn vote(
        &self,
        key: &EntityKey,
        actor: &Actor,
        step: usize,
        status: ApprovalStatus,
        comment: String,
    ) -> EngineResult<ApprovalOutcome> {
        let operation = match status {
            ApprovalStatus::Rejected => "reject",
            _ => "approve",
        };
        let timer = OpTimer::new("engine", operation);

        self.limiter.admit(actor).await?;

        let ctx = Arc::new(self.vote_context(key, actor, step, status, comment));
        let options = TxOptions::new(operation).with_entity(key.to_string());
        let result = self
            .coordinator
            .run(&options, move |conn| Box::pin(cast_vote(conn, Arc::clone(&ctx))))
            .await;
        self.cache.invalidate(key);

        match &result {
            Ok(outcome) => tracing::info!(
                entity = %key,
                actor_id = %actor.id,
                step,
                status = status.as_str(),
                from = %outcome.previous_state,
                to = %outcome.current_state,
                version = outcome.version,
                "Vote recorded"
            ),
            Err(e) => tracing::warn!(
                entity = %key,
                actor_id = %actor.id,
                step,
                error_kind = %e.kind(),
                error = %e,
                "Vote refused"
            ),
        }
        timer.finish_with_result(result.as_ref());
        result
    }

    fn vote_context(
        &self,
        key: &EntityKey,
        actor: &Actor,
        step: usize,
        status: ApprovalStatus,
        comment: String,
    ) -> VoteContext {
        VoteContext {
            key: key.clone(),
            step,
            actor: actor.clone(),
            status,
            comment,
            catalog: Arc::clone(&self.catalog),
            cache: Arc::clone(&self.cache),
            settings: Arc::clone(&self.settings),
        }
    }

    /// Approve many items in chunked transactions.
    ///
    /// Domain failures (validation, authorization, duplicates, rate limits)
    /// are reported per item and do not abort their chunk. A storage failure
    /// that survives retries aborts the remaining chunks and is returned;
    /// chunks committed before it stay committed.
    pub async fn bulk_approve(
        &self,
        requests: Vec<BulkApprovalRequest>,
        chunk_size: Option<usize>,
    ) -> EngineResult<Vec<ActionResult>> {
        let chunk_size = chunk_size.unwrap_or(self.settings.bulk_chunk_size);
        let mut results: Vec<Option<ActionResult>> = vec![None; requests.len()];
        let mut ops: Vec<TxOp<F::Connection, EngineResult<ApprovalOutcome>>> = Vec::new();
        let mut slots = Vec::new();
        let mut keys = Vec::new();

        for (slot, request) in requests.into_iter().enumerate() {
            if let Err(e) = self.limiter.admit(&request.actor).await {
                results[slot] = Some(ActionResult::from(&e));
                continue;
            }
            let comment = sanitize_comment(&request.comment, self.settings.max_comment_length);
            let ctx = self.vote_context(
                &request.key,
                &request.actor,
                request.step,
                ApprovalStatus::Approved,
                comment,
            );
            ops.push(bulk_vote_op(Arc::new(ctx)));
            slots.push(slot);
            keys.push(request.key);
        }

        let batch = self
            .coordinator
            .batch_operation("bulk_approve", ops, chunk_size)
            .await;
        for key in &keys {
            self.cache.invalidate(key);
        }

        for (slot, outcome) in slots.into_iter().zip(batch?) {
            results[slot] = Some(ActionResult::from_result(outcome));
        }
        let results: Vec<ActionResult> = results.into_iter().flatten().collect();
        tracing::info!(
            items = results.len(),
            succeeded = results.iter().filter(|r| r.success).count(),
            "Bulk approval finished"
        );
        Ok(results)
    }

    /// Hand `actor`'s vote on the current step to `to_actor`.
    ///
    /// `step`, when given, must be the current step.
    pub async fn delegate(
        &self,
        key: &EntityKey,
        actor: &Actor,
        step: Option<usize>,
        to_actor: &str,
        reason: &str,
    ) -> EngineResult<WorkflowInstance> {
        self.limiter.admit(actor).await?;
        let reason = self.justification(reason, "delegation")?;

        let snapshot = self.get_instance(key).await?;
        let definition = self.definition_for(&snapshot)?;
        let view = self.cache.get(&snapshot);
        let step = gates::check_delegation(&snapshot, &definition, &view, actor, step, to_actor)?;

        let delegation = Delegation {
            step,
            from_actor: actor.id.clone(),
            to_actor: to_actor.to_string(),
            reason,
            at: Utc::now(),
        };
        let audit = self.settings.audit_enabled;
        let (instance, ()) = self
            .coordinator
            .execute_with_optimistic_locking("delegate", &snapshot, move |instance| {
                instance.delegations.push(delegation.clone());
                let event = audit.then(|| {
                    SecurityEvent::new(
                        instance.key.clone(),
                        AuditAction::Delegated,
                        &delegation.from_actor,
                        Some(delegation.step),
                        (&instance.current_state, &instance.current_state),
                        format!("to {}: {}", delegation.to_actor, delegation.reason),
                    )
                });
                Ok(((), event))
            })
            .await?;
        self.cache.invalidate(key);

        tracing::info!(
            entity = %key,
            step,
            from_actor = %actor.id,
            to_actor,
            version = instance.version,
            "Vote delegated"
        );
        Ok(instance)
    }

    /// Escalate the current step, letting holders of its escalation role
    /// vote.
    pub async fn escalate(
        &self,
        key: &EntityKey,
        actor: &Actor,
        reason: &str,
        trigger: EscalationTrigger,
    ) -> EngineResult<WorkflowInstance> {
        self.limiter.admit(actor).await?;
        let reason = self.justification(reason, "escalation")?;

        let snapshot = self.get_instance(key).await?;
        let definition = self.definition_for(&snapshot)?;
        let now = Utc::now();
        let step = gates::check_escalation(&snapshot, &definition, actor, trigger, now)?;

        let escalation = Escalation {
            step,
            actor_id: actor.id.clone(),
            reason,
            trigger,
            at: now,
        };
        let audit = self.settings.audit_enabled;
        let (instance, ()) = self
            .coordinator
            .execute_with_optimistic_locking("escalate", &snapshot, move |instance| {
                instance.escalations.push(escalation.clone());
                let event = audit.then(|| {
                    SecurityEvent::new(
                        instance.key.clone(),
                        AuditAction::Escalated,
                        &escalation.actor_id,
                        Some(escalation.step),
                        (&instance.current_state, &instance.current_state),
                        format!("{}: {}", escalation.trigger.as_str(), escalation.reason),
                    )
                });
                Ok(((), event))
            })
            .await?;
        self.cache.invalidate(key);

        tracing::info!(
            entity = %key,
            step,
            actor_id = %actor.id,
            trigger = trigger.as_str(),
            version = instance.version,
            "Step escalated"
        );
        Ok(instance)
    }

    /// Move the workflow on `key` to its timeout state if the current step
    /// has been open longer than its timeout at `now`. Returns whether it
    /// expired.
    pub async fn expire_overdue(&self, key: &EntityKey, now: DateTime<Utc>) -> EngineResult<bool> {
        let catalog = Arc::clone(&self.catalog);
        let audit = self.settings.audit_enabled;
        let options = TxOptions::new("expire_overdue").with_entity(key.to_string());
        let expired = {
            let key = key.clone();
            self.coordinator
                .run(&options, move |conn| {
                    Box::pin(expire_instance(
                        conn,
                        key.clone(),
                        now,
                        Arc::clone(&catalog),
                        audit,
                    ))
                })
                .await?
        };
        if expired {
            self.cache.invalidate(key);
            tracing::info!(entity = %key, "Workflow timed out");
        }
        Ok(expired)
    }

    /// Current committed instance on `key`.
    pub async fn get_instance(&self, key: &EntityKey) -> EngineResult<WorkflowInstance> {
        let options = TxOptions::new("get_instance").with_entity(key.to_string());
        let key = key.clone();
        self.coordinator
            .run(&options, move |conn| Box::pin(read_instance(conn, key.clone())))
            .await
    }

    /// Indexed view of the history on `key`.
    pub async fn view(&self, key: &EntityKey) -> EngineResult<Arc<IndexedApprovalView>> {
        let instance = self.get_instance(key).await?;
        Ok(self.cache.get(&instance))
    }

    /// Whether `step` on `key` has the approvals it requires.
    pub async fn is_step_complete(&self, key: &EntityKey, step: usize) -> EngineResult<bool> {
        let instance = self.get_instance(key).await?;
        let definition = self.definition_for(&instance)?;
        Ok(self.cache.get(&instance).is_step_complete(&definition, step))
    }

    /// Positions of history records whose integrity hash does not match.
    pub async fn verify_history(&self, key: &EntityKey) -> EngineResult<Vec<usize>> {
        let instance = self.get_instance(key).await?;
        let tampered: Vec<usize> = instance
            .approval_history
            .iter()
            .enumerate()
            .filter(|(_, record)| !record.verify(&self.settings.integrity_key))
            .map(|(index, _)| index)
            .collect();
        if !tampered.is_empty() {
            tracing::error!(
                entity = %key,
                records = ?tampered,
                "Approval history failed integrity verification"
            );
        }
        Ok(tampered)
    }

    fn justification(&self, raw: &str, what: &str) -> EngineResult<String> {
        let reason = sanitize_comment(raw, self.settings.max_comment_length);
        if reason.is_empty() {
            return Err(EngineError::validation(format!("a {what} reason is required")));
        }
        Ok(reason)
    }

    fn definition_for(&self, instance: &WorkflowInstance) -> EngineResult<Arc<WorkflowDefinition>> {
        definition_for(&self.catalog, instance)
    }
}

fn definition_for(
    catalog: &DefinitionCatalog,
    instance: &WorkflowInstance,
) -> EngineResult<Arc<WorkflowDefinition>> {
    catalog.get(&instance.definition).ok_or_else(|| {
        EngineError::NotFound(format!("workflow definition '{}'", instance.definition))
    })
}

async fn lock_instance<C: StoreConnection>(
    conn: &mut C,
    key: &EntityKey,
) -> EngineResult<WorkflowInstance> {
    match conn.lock_row(key).await {
        Ok(instance) => Ok(instance),
        Err(e) if e.kind == StoreErrorKind::NotFound => {
            Err(EngineError::NotFound(format!("workflow for {key}")))
        }
        Err(e) => Err(e.into()),
    }
}

async fn read_instance<C: StoreConnection>(
    conn: &mut C,
    key: EntityKey,
) -> EngineResult<WorkflowInstance> {
    conn.read(&key)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("workflow for {key}")))
}

async fn insert_instance<C: StoreConnection>(
    conn: &mut C,
    instance: WorkflowInstance,
    audit: bool,
) -> EngineResult<WorkflowInstance> {
    if conn.read(&instance.key).await?.is_some() {
        return Err(EngineError::validation(format!(
            "{} already has a workflow attached",
            instance.key
        )));
    }
    conn.insert(&instance).await?;
    if audit {
        let event = SecurityEvent::new(
            instance.key.clone(),
            AuditAction::WorkflowCreated,
            &instance.owner_id,
            None,
            ("", &instance.current_state),
            format!("definition {}", instance.definition),
        );
        conn.append_audit(&event).await?;
    }
    Ok(instance)
}

async fn cast_vote<C: StoreConnection>(
    conn: &mut C,
    ctx: Arc<VoteContext>,
) -> EngineResult<ApprovalOutcome> {
    let mut instance = lock_instance(conn, &ctx.key).await?;
    tracing::debug!(entity = %ctx.key, version = instance.version, "Row locked");

    let definition = definition_for(&ctx.catalog, &instance)?;
    let view = ctx.cache.get(&instance);
    let grant = gates::check_vote(&instance, &definition, &view, &ctx.actor, ctx.step)?;
    let config: &StepConfig = definition
        .steps
        .get(ctx.step)
        .ok_or_else(|| EngineError::validation(format!("step {} is out of range", ctx.step)))?;

    let now = Utc::now();
    let record = ApprovalRecord::new(
        &ctx.actor.id,
        ctx.step,
        ctx.status,
        ctx.comment.clone(),
        now,
        grant.on_behalf_of.clone(),
        &ctx.settings.integrity_key,
    );
    let previous_state = instance.current_state.clone();
    instance.approval_history.push(record.clone());

    let approvals = view.step_count(ctx.step) + usize::from(ctx.status == ApprovalStatus::Approved);
    let step_completed =
        ctx.status == ApprovalStatus::Approved && approvals >= config.required_approvals as usize;
    let next_state = if step_completed {
        Some(definition.state_after(ctx.step))
    } else if ctx.status == ApprovalStatus::Rejected
        && definition.rejection_policy == RejectionPolicy::ShortCircuit
    {
        Some(definition.rejected_state.clone())
    } else {
        None
    };
    if let Some(state) = next_state {
        instance.transition_to(state, &definition, now);
    }

    instance.version += 1;
    conn.write(&instance).await?;

    if ctx.settings.audit_enabled {
        let action = if ctx.status == ApprovalStatus::Rejected {
            AuditAction::Rejected
        } else {
            AuditAction::Approved
        };
        let detail = match &record.on_behalf_of {
            Some(delegator) => format!("on behalf of {delegator}"),
            None => String::new(),
        };
        let event = SecurityEvent::new(
            ctx.key.clone(),
            action,
            &ctx.actor.id,
            Some(ctx.step),
            (&previous_state, &instance.current_state),
            detail,
        );
        conn.append_audit(&event).await?;
    }

    Ok(ApprovalOutcome {
        success: true,
        record,
        workflow_completed: definition.is_terminal(&instance.current_state),
        current_state: instance.current_state,
        previous_state,
        step_completed,
        version: instance.version,
    })
}

/// Vote inside a bulk chunk: domain failures become the item's result so the
/// rest of the chunk still commits. Gates run before any write, so a refused
/// item leaves nothing staged.
async fn bulk_vote<C: StoreConnection>(
    conn: &mut C,
    ctx: Arc<VoteContext>,
) -> EngineResult<EngineResult<ApprovalOutcome>> {
    match cast_vote(conn, ctx).await {
        Ok(outcome) => Ok(Ok(outcome)),
        Err(e) if FailureClass::classify(&e) == FailureClass::Domain => Ok(Err(e)),
        Err(e) => Err(e),
    }
}

fn bulk_vote_op<C: StoreConnection>(
    ctx: Arc<VoteContext>,
) -> TxOp<C, EngineResult<ApprovalOutcome>> {
    tx_op(move |conn| Box::pin(bulk_vote(conn, Arc::clone(&ctx))))
}

async fn expire_instance<C: StoreConnection>(
    conn: &mut C,
    key: EntityKey,
    now: DateTime<Utc>,
    catalog: Arc<DefinitionCatalog>,
    audit: bool,
) -> EngineResult<bool> {
    let mut instance = lock_instance(conn, &key).await?;
    let definition = definition_for(&catalog, &instance)?;

    let Some(step) = definition.current_step_index(&instance.current_state) else {
        return Ok(false);
    };
    let Some(timeout) = definition.steps.get(step).and_then(StepConfig::timeout) else {
        return Ok(false);
    };
    let open_for = instance.time_in_state(now);
    if open_for < timeout {
        return Ok(false);
    }

    let previous_state = instance.current_state.clone();
    instance.transition_to(definition.timeout_state.clone(), &definition, now);
    instance.version += 1;
    conn.write(&instance).await?;

    if audit {
        let event = SecurityEvent::new(
            key,
            AuditAction::TimedOut,
            SYSTEM_ACTOR,
            Some(step),
            (&previous_state, &instance.current_state),
            format!("step open for {}s, limit {}s", open_for.as_secs(), timeout.as_secs()),
        );
        conn.append_audit(&event).await?;
    }
    Ok(true)
}
