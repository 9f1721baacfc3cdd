//! Indexed projection of an instance's approval history.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::domain::{ApprovalRecord, ApprovalStatus, WorkflowDefinition, WorkflowInstance};

/// Approval history grouped by step and by actor.
///
/// Built in one pass over the history. Valid for an instance only while
/// `total_count` equals the length of its history.
#[derive(Debug, Clone, Default)]
pub struct IndexedApprovalView {
    /// Records per step, in history order.
    pub step_approvals: HashMap<usize, Vec<ApprovalRecord>>,
    /// Approved votes per step.
    pub step_counts: HashMap<usize, usize>,
    /// Rejections per step.
    pub step_rejections: HashMap<usize, usize>,
    /// Records per acting actor, in history order.
    pub actor_approvals: HashMap<String, Vec<ApprovalRecord>>,
    /// Records indexed.
    pub total_count: usize,
    /// When the view was built.
    pub built_at: DateTime<Utc>,
    voted: HashSet<(usize, String)>,
}

impl IndexedApprovalView {
    /// Index `history`.
    #[must_use]
    pub fn build(history: &[ApprovalRecord]) -> Self {
        let mut view = Self {
            built_at: Utc::now(),
            ..Self::default()
        };
        for record in history {
            view.push(record.clone());
        }
        view
    }

    fn push(&mut self, record: ApprovalRecord) {
        match record.status {
            ApprovalStatus::Approved => *self.step_counts.entry(record.step).or_default() += 1,
            ApprovalStatus::Rejected => *self.step_rejections.entry(record.step).or_default() += 1,
            ApprovalStatus::Revoked => {}
        }
        self.voted.insert((record.step, record.voter().to_string()));
        self.actor_approvals
            .entry(record.actor_id.clone())
            .or_default()
            .push(record.clone());
        self.step_approvals.entry(record.step).or_default().push(record);
        self.total_count += 1;
    }

    /// Approved votes on `step`.
    #[must_use]
    pub fn step_count(&self, step: usize) -> usize {
        self.step_counts.get(&step).copied().unwrap_or(0)
    }

    /// Rejections on `step`.
    #[must_use]
    pub fn rejection_count(&self, step: usize) -> usize {
        self.step_rejections.get(&step).copied().unwrap_or(0)
    }

    /// Whether `step` has the approvals its definition requires.
    #[must_use]
    pub fn is_step_complete(&self, definition: &WorkflowDefinition, step: usize) -> bool {
        definition
            .steps
            .get(step)
            .is_some_and(|config| self.step_count(step) >= config.required_approvals as usize)
    }

    /// Whether `voter` already cast a vote on `step`, directly or through a
    /// delegate.
    #[must_use]
    pub fn has_voted(&self, step: usize, voter: &str) -> bool {
        self.voted.contains(&(step, voter.to_string()))
    }

    /// Records on `step`.
    #[must_use]
    pub fn records_for_step(&self, step: usize) -> &[ApprovalRecord] {
        self.step_approvals.get(&step).map_or(&[], Vec::as_slice)
    }

    /// Records written by `actor_id`.
    #[must_use]
    pub fn records_by_actor(&self, actor_id: &str) -> &[ApprovalRecord] {
        self.actor_approvals.get(actor_id).map_or(&[], Vec::as_slice)
    }

    /// Whether this view still describes `instance`.
    #[must_use]
    pub fn is_valid_for(&self, instance: &WorkflowInstance) -> bool {
        self.total_count == instance.approval_history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IntegrityKey, StepConfig};
    use proptest::prelude::*;

    fn record(actor: &str, step: usize, status: ApprovalStatus) -> ApprovalRecord {
        ApprovalRecord::new(
            actor,
            step,
            status,
            "",
            Utc::now(),
            None,
            &IntegrityKey::unconfigured(),
        )
    }

    #[test]
    fn test_build_groups_by_step_and_actor() {
        let history = vec![
            record("alice", 0, ApprovalStatus::Approved),
            record("bob", 0, ApprovalStatus::Rejected),
            record("alice", 1, ApprovalStatus::Approved),
            record("carol", 1, ApprovalStatus::Revoked),
        ];
        let view = IndexedApprovalView::build(&history);

        assert_eq!(view.total_count, 4);
        assert_eq!(view.step_count(0), 1);
        assert_eq!(view.rejection_count(0), 1);
        assert_eq!(view.step_count(1), 1);
        assert_eq!(view.records_for_step(1).len(), 2);
        assert_eq!(view.records_by_actor("alice").len(), 2);
        assert!(view.has_voted(0, "bob"));
        assert!(!view.has_voted(1, "bob"));
        assert!(view.records_for_step(7).is_empty());
    }

    #[test]
    fn test_delegated_vote_counts_for_delegator() {
        let mut delegated = record("dave", 0, ApprovalStatus::Approved);
        delegated.on_behalf_of = Some("alice".to_string());
        let view = IndexedApprovalView::build(&[delegated]);

        assert!(view.has_voted(0, "alice"));
        assert!(!view.has_voted(0, "dave"));
        assert_eq!(view.records_by_actor("dave").len(), 1);
    }

    #[test]
    fn test_step_completion() {
        let definition = WorkflowDefinition::new(
            "two_of",
            vec![StepConfig::new("review", "reviewer").with_required_approvals(2)],
        );
        let one = IndexedApprovalView::build(&[record("a", 0, ApprovalStatus::Approved)]);
        assert!(!one.is_step_complete(&definition, 0));

        let two = IndexedApprovalView::build(&[
            record("a", 0, ApprovalStatus::Approved),
            record("b", 0, ApprovalStatus::Approved),
        ]);
        assert!(two.is_step_complete(&definition, 0));
        assert!(!two.is_step_complete(&definition, 5));
    }

    #[test]
    fn test_empty_history() {
        let view = IndexedApprovalView::build(&[]);
        assert_eq!(view.total_count, 0);
        assert_eq!(view.step_count(0), 0);
        assert!(!view.has_voted(0, "alice"));
        assert!(view.records_for_step(0).is_empty());
    }

    #[test]
    fn test_ten_thousand_records_match_linear_scan() {
        const STEPS: usize = 7;
        const ACTORS: usize = 97;

        let history: Vec<ApprovalRecord> = (0..10_000usize)
            .map(|i| {
                let status = match i % 5 {
                    0..=2 => ApprovalStatus::Approved,
                    3 => ApprovalStatus::Rejected,
                    _ => ApprovalStatus::Revoked,
                };
                record(&format!("actor{}", (i * 31) % ACTORS), i % STEPS, status)
            })
            .collect();
        let view = IndexedApprovalView::build(&history);

        assert_eq!(view.total_count, 10_000);
        for step in 0..STEPS {
            let approved = history
                .iter()
                .filter(|r| r.step == step && r.status == ApprovalStatus::Approved)
                .count();
            assert_eq!(view.step_count(step), approved, "step {step}");
            assert_eq!(
                view.records_for_step(step).len(),
                history.iter().filter(|r| r.step == step).count()
            );
            for actor in 0..ACTORS {
                let name = format!("actor{actor}");
                let voted = history.iter().any(|r| r.step == step && r.actor_id == name);
                assert_eq!(view.has_voted(step, &name), voted, "step {step} {name}");
            }
        }
        assert_eq!(
            view.actor_approvals.values().map(Vec::len).sum::<usize>(),
            history.len()
        );
    }

    fn arb_status() -> impl Strategy<Value = ApprovalStatus> {
        prop_oneof![
            Just(ApprovalStatus::Approved),
            Just(ApprovalStatus::Rejected),
            Just(ApprovalStatus::Revoked),
        ]
    }

    proptest! {
        #[test]
        fn prop_counts_match_linear_scan(
            votes in proptest::collection::vec((0usize..4, 0usize..6, arb_status()), 0..60)
        ) {
            let history: Vec<ApprovalRecord> = votes
                .iter()
                .map(|(step, actor, status)| record(&format!("actor{actor}"), *step, *status))
                .collect();
            let view = IndexedApprovalView::build(&history);

            prop_assert_eq!(view.total_count, history.len());
            for step in 0..4 {
                let scanned = history
                    .iter()
                    .filter(|r| r.step == step && r.status == ApprovalStatus::Approved)
                    .count();
                prop_assert_eq!(view.step_count(step), scanned);
                for actor in 0..6 {
                    let name = format!("actor{actor}");
                    let voted = history.iter().any(|r| r.step == step && r.actor_id == name);
                    prop_assert_eq!(view.has_voted(step, &name), voted);
                }
            }
        }
    }
}
