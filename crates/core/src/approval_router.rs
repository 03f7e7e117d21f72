use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::GuardrailConfig;
use crate::domain::approval::{Approval, ApprovalId, ApprovalStatus};
use crate::domain::deal::{Deal, DealId, GuardrailStatus};
use crate::errors::DomainError;
use crate::guardrails::GuardrailVerdict;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("deal `{deal_id}` has no pending approval chain")]
    NoPendingChain { deal_id: DealId },
    #[error("deal `{deal_id}` is locked; its approval chain already completed")]
    AlreadyLocked { deal_id: DealId },
    #[error("approval `{approval_id}` was not found")]
    UnknownApproval { approval_id: ApprovalId },
    #[error("approval `{approval_id}` is not the current step of its chain")]
    NotCurrentStep { approval_id: ApprovalId },
    #[error("approval `{approval_id}` was already resolved as `{status}`")]
    AlreadyResolved { approval_id: ApprovalId, status: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approve,
    Reject,
}

/// A reviewer's decision on one step, as submitted at the interface tier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub outcome: ApprovalOutcome,
    #[serde(default)]
    pub approver_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ApprovalDecision {
    pub fn approve(approver_id: impl Into<String>) -> Self {
        Self { outcome: ApprovalOutcome::Approve, approver_id: Some(approver_id.into()), notes: None }
    }

    pub fn reject(approver_id: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            outcome: ApprovalOutcome::Reject,
            approver_id: Some(approver_id.into()),
            notes: Some(notes.into()),
        }
    }
}

/// Where a chain stands after one step is completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainOutcome {
    /// The approved step handed off to the next one in sequence.
    AwaitingNext,
    /// Every step approved; the deal's guardrail verdict is now locked.
    Approved,
    /// A step rejected the deal; the remaining steps were cancelled.
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscalationOutcome {
    Escalated,
    Unchanged,
}

/// The step reviewers act on next: the lowest-sequence open step. Cancelled
/// prior chains never surface here because replacement closes their steps.
pub fn current_open_step<'a>(
    deal_id: &DealId,
    chain: &'a [Approval],
) -> Result<&'a Approval, RoutingError> {
    chain
        .iter()
        .filter(|approval| approval.status.is_open())
        .min_by_key(|approval| approval.sequence_order)
        .ok_or_else(|| RoutingError::NoPendingChain { deal_id: deal_id.clone() })
}

/// Open steps past their due date, oldest first. The sqlite repository runs
/// the equivalent query for the scheduler; this serves in-memory callers.
pub fn overdue_steps<'a>(chain: &'a [Approval], now: DateTime<Utc>) -> Vec<&'a Approval> {
    let mut overdue: Vec<&Approval> =
        chain.iter().filter(|approval| approval.is_overdue(now)).collect();
    overdue.sort_by_key(|approval| approval.due_at);
    overdue
}

/// Builds and advances a deal's approval chain from guardrail verdicts.
/// Chain math is pure; callers persist the mutated rows afterwards.
pub struct ApprovalRouter {
    limits: GuardrailConfig,
}

impl ApprovalRouter {
    pub fn new(limits: GuardrailConfig) -> Self {
        Self { limits }
    }

    /// Builds the ordered chain a verdict requires, one pending step per
    /// required approval with its SLA deadline. Any open steps of a prior
    /// chain are cancelled in place; the rows stay behind for audit.
    pub fn route(
        &self,
        deal: &Deal,
        verdict: &GuardrailVerdict,
        prior: &mut [Approval],
        now: DateTime<Utc>,
    ) -> Result<Vec<Approval>, RoutingError> {
        if deal.guardrail_locked {
            return Err(RoutingError::AlreadyLocked { deal_id: deal.id.clone() });
        }

        for stale in prior.iter_mut().filter(|approval| approval.status.is_open()) {
            stale.status = ApprovalStatus::Cancelled;
            stale.updated_at = now;
        }

        let chain = verdict
            .required_steps
            .iter()
            .enumerate()
            .map(|(index, step)| Approval {
                id: ApprovalId(Uuid::new_v4().to_string()),
                deal_id: deal.id.clone(),
                step: *step,
                sequence_order: index as u32 + 1,
                status: ApprovalStatus::Pending,
                approver_id: None,
                notes: None,
                due_at: now + Duration::hours(i64::from(self.limits.sla_hours_for(*step))),
                completed_at: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        Ok(chain)
    }

    /// Records a decision on the chain's current step. Approving the final
    /// step clears the deal's violated status and locks the verdict for
    /// good; a rejection cancels the rest of the chain and sends the deal
    /// back to pricing.
    pub fn complete(
        &self,
        deal: &mut Deal,
        chain: &mut [Approval],
        approval_id: &ApprovalId,
        decision: &ApprovalDecision,
        now: DateTime<Utc>,
    ) -> Result<ChainOutcome, DomainError> {
        let index = chain
            .iter()
            .position(|approval| approval.id == *approval_id)
            .ok_or_else(|| RoutingError::UnknownApproval { approval_id: approval_id.clone() })?;

        if chain[index].status.is_terminal() {
            return Err(RoutingError::AlreadyResolved {
                approval_id: approval_id.clone(),
                status: chain[index].status.as_str().to_string(),
            }
            .into());
        }

        let current_id = current_open_step(&deal.id, chain)?.id.clone();
        if current_id != *approval_id {
            return Err(
                RoutingError::NotCurrentStep { approval_id: approval_id.clone() }.into()
            );
        }

        match decision.outcome {
            ApprovalOutcome::Approve => {
                let step = &mut chain[index];
                step.status = ApprovalStatus::Approved;
                step.approver_id = decision.approver_id.clone();
                step.notes = decision.notes.clone();
                step.completed_at = Some(now);
                step.updated_at = now;

                if chain.iter().any(|approval| approval.status.is_open()) {
                    Ok(ChainOutcome::AwaitingNext)
                } else {
                    deal.guardrail_status = GuardrailStatus::Pass;
                    deal.guardrail_reason = None;
                    deal.guardrail_locked = true;
                    deal.updated_at = now;
                    Ok(ChainOutcome::Approved)
                }
            }
            ApprovalOutcome::Reject => {
                {
                    let step = &mut chain[index];
                    step.status = ApprovalStatus::Rejected;
                    step.approver_id = decision.approver_id.clone();
                    step.notes = decision.notes.clone();
                    step.completed_at = Some(now);
                    step.updated_at = now;
                }
                for remaining in chain.iter_mut().filter(|approval| approval.status.is_open()) {
                    remaining.status = ApprovalStatus::Cancelled;
                    remaining.updated_at = now;
                }
                deal.revert_to_pricing(now)?;
                Ok(ChainOutcome::Rejected)
            }
        }
    }

    /// Marks an overdue pending step escalated. Escalated steps stay the
    /// current step and remain completable. Calling this on an already
    /// escalated or resolved step changes nothing.
    pub fn escalate(
        &self,
        chain: &mut [Approval],
        approval_id: &ApprovalId,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome, RoutingError> {
        let step = chain
            .iter_mut()
            .find(|approval| approval.id == *approval_id)
            .ok_or_else(|| RoutingError::UnknownApproval { approval_id: approval_id.clone() })?;

        if step.status == ApprovalStatus::Pending && step.is_overdue(now) {
            step.status = ApprovalStatus::Escalated;
            step.updated_at = now;
            Ok(EscalationOutcome::Escalated)
        } else {
            Ok(EscalationOutcome::Unchanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{
        current_open_step, overdue_steps, ApprovalDecision, ApprovalRouter, ChainOutcome,
        EscalationOutcome, RoutingError,
    };
    use crate::config::GuardrailConfig;
    use crate::domain::approval::{Approval, ApprovalStatus, ApprovalStep};
    use crate::domain::deal::{Deal, DealId, DealStage, GuardrailStatus, RiskTier};
    use crate::errors::DomainError;
    use crate::guardrails::GuardrailVerdict;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    fn router() -> ApprovalRouter {
        ApprovalRouter::new(GuardrailConfig::default())
    }

    fn deal_in(stage: DealStage) -> Deal {
        Deal {
            id: DealId("D-200".to_string()),
            name: "Northwind expansion".to_string(),
            amount: Decimal::new(12_000_000, 2),
            currency: "USD".to_string(),
            discount_percent: Decimal::new(250, 1),
            payment_terms_days: 30,
            risk: RiskTier::Medium,
            segment: Some("enterprise".to_string()),
            stage,
            guardrail_status: GuardrailStatus::Violated,
            guardrail_reason: Some(
                "discount 25.0% exceeds 20.0% limit for medium risk".to_string(),
            ),
            guardrail_locked: false,
            operational_cost: Decimal::ZERO,
            quote_generated_at: None,
            agreement_signed_at: None,
            payment_collected_at: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    fn violated_verdict(steps: Vec<ApprovalStep>) -> GuardrailVerdict {
        GuardrailVerdict {
            status: GuardrailStatus::Violated,
            violations: Vec::new(),
            required_steps: steps,
            evaluated_at: now(),
        }
    }

    fn two_step_chain(deal: &Deal, router: &ApprovalRouter) -> Vec<Approval> {
        let verdict =
            violated_verdict(vec![ApprovalStep::FinanceReview, ApprovalStep::ExecutiveApproval]);
        router.route(deal, &verdict, &mut [], now()).unwrap()
    }

    #[test]
    fn routes_steps_in_sequence_with_sla_deadlines() {
        let deal = deal_in(DealStage::FinanceReview);
        let chain = two_step_chain(&deal, &router());

        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].step, ApprovalStep::FinanceReview);
        assert_eq!(chain[0].sequence_order, 1);
        assert_eq!(chain[0].due_at, now() + Duration::hours(24));
        assert_eq!(chain[1].step, ApprovalStep::ExecutiveApproval);
        assert_eq!(chain[1].sequence_order, 2);
        assert_eq!(chain[1].due_at, now() + Duration::hours(48));
        assert!(chain.iter().all(|approval| approval.status == ApprovalStatus::Pending));
    }

    #[test]
    fn routing_cancels_the_incomplete_prior_chain() {
        let router = router();
        let deal = deal_in(DealStage::FinanceReview);
        let mut prior = two_step_chain(&deal, &router);

        let verdict = violated_verdict(vec![ApprovalStep::FinanceReview]);
        let replacement =
            router.route(&deal, &verdict, &mut prior, now() + Duration::hours(1)).unwrap();

        assert!(prior.iter().all(|approval| approval.status == ApprovalStatus::Cancelled));
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].status, ApprovalStatus::Pending);
    }

    #[test]
    fn locked_deals_take_no_new_chain() {
        let router = router();
        let mut deal = deal_in(DealStage::FinanceReview);
        deal.guardrail_locked = true;

        let verdict = violated_verdict(vec![ApprovalStep::FinanceReview]);
        let error = router.route(&deal, &verdict, &mut [], now()).unwrap_err();
        assert_eq!(error, RoutingError::AlreadyLocked { deal_id: deal.id });
    }

    #[test]
    fn approving_the_current_step_unblocks_the_next() {
        let router = router();
        let mut deal = deal_in(DealStage::FinanceReview);
        let mut chain = two_step_chain(&deal, &router);
        let first = chain[0].id.clone();

        let outcome = router
            .complete(&mut deal, &mut chain, &first, &ApprovalDecision::approve("fin-1"), now())
            .unwrap();

        assert_eq!(outcome, ChainOutcome::AwaitingNext);
        assert_eq!(chain[0].status, ApprovalStatus::Approved);
        assert_eq!(chain[0].approver_id.as_deref(), Some("fin-1"));
        assert_eq!(chain[0].completed_at, Some(now()));
        assert_eq!(current_open_step(&deal.id, &chain).unwrap().id, chain[1].id);
        assert!(!deal.guardrail_locked);
    }

    #[test]
    fn final_approval_clears_the_violation_and_locks_the_deal() {
        let router = router();
        let mut deal = deal_in(DealStage::ExecutiveApproval);
        let mut chain = two_step_chain(&deal, &router);
        let first = chain[0].id.clone();
        let second = chain[1].id.clone();

        router
            .complete(&mut deal, &mut chain, &first, &ApprovalDecision::approve("fin-1"), now())
            .unwrap();
        let outcome = router
            .complete(&mut deal, &mut chain, &second, &ApprovalDecision::approve("exec-1"), now())
            .unwrap();

        assert_eq!(outcome, ChainOutcome::Approved);
        assert_eq!(deal.guardrail_status, GuardrailStatus::Pass);
        assert_eq!(deal.guardrail_reason, None);
        assert!(deal.guardrail_locked);
    }

    #[test]
    fn rejection_reverts_the_deal_and_cancels_the_rest() {
        let router = router();
        let mut deal = deal_in(DealStage::FinanceReview);
        let mut chain = two_step_chain(&deal, &router);
        let first = chain[0].id.clone();

        let outcome = router
            .complete(
                &mut deal,
                &mut chain,
                &first,
                &ApprovalDecision::reject("fin-1", "margin too thin"),
                now(),
            )
            .unwrap();

        assert_eq!(outcome, ChainOutcome::Rejected);
        assert_eq!(chain[0].status, ApprovalStatus::Rejected);
        assert_eq!(chain[0].notes.as_deref(), Some("margin too thin"));
        assert_eq!(chain[1].status, ApprovalStatus::Cancelled);
        assert_eq!(deal.stage, DealStage::Pricing);
        assert_eq!(deal.guardrail_status, GuardrailStatus::Violated);
        assert!(!deal.guardrail_locked);
    }

    #[test]
    fn out_of_order_completion_is_refused() {
        let router = router();
        let mut deal = deal_in(DealStage::FinanceReview);
        let mut chain = two_step_chain(&deal, &router);
        let second = chain[1].id.clone();

        let error = router
            .complete(&mut deal, &mut chain, &second, &ApprovalDecision::approve("exec-1"), now())
            .unwrap_err();

        assert_eq!(
            error,
            DomainError::Routing(RoutingError::NotCurrentStep { approval_id: second })
        );
        assert_eq!(chain[1].status, ApprovalStatus::Pending);
    }

    #[test]
    fn resolved_steps_cannot_be_completed_again() {
        let router = router();
        let mut deal = deal_in(DealStage::FinanceReview);
        let mut chain = two_step_chain(&deal, &router);
        let first = chain[0].id.clone();

        router
            .complete(&mut deal, &mut chain, &first, &ApprovalDecision::approve("fin-1"), now())
            .unwrap();
        let error = router
            .complete(&mut deal, &mut chain, &first, &ApprovalDecision::approve("fin-2"), now())
            .unwrap_err();

        assert_eq!(
            error,
            DomainError::Routing(RoutingError::AlreadyResolved {
                approval_id: first,
                status: "approved".to_string(),
            })
        );
    }

    #[test]
    fn unknown_approvals_are_refused() {
        let router = router();
        let mut deal = deal_in(DealStage::FinanceReview);
        let mut chain = two_step_chain(&deal, &router);
        let missing = crate::domain::approval::ApprovalId("nope".to_string());

        let error = router
            .complete(&mut deal, &mut chain, &missing, &ApprovalDecision::approve("fin-1"), now())
            .unwrap_err();
        assert_eq!(
            error,
            DomainError::Routing(RoutingError::UnknownApproval { approval_id: missing })
        );
    }

    #[test]
    fn empty_chain_reports_no_pending_work() {
        let deal = deal_in(DealStage::Pricing);
        let error = current_open_step(&deal.id, &[]).unwrap_err();
        assert_eq!(error, RoutingError::NoPendingChain { deal_id: deal.id });
    }

    #[test]
    fn escalation_marks_overdue_steps_and_is_idempotent() {
        let router = router();
        let mut deal = deal_in(DealStage::FinanceReview);
        let mut chain = two_step_chain(&deal, &router);
        let first = chain[0].id.clone();
        let past_due = now() + Duration::hours(25);

        let outcome = router.escalate(&mut chain, &first, past_due).unwrap();
        assert_eq!(outcome, EscalationOutcome::Escalated);
        assert_eq!(chain[0].status, ApprovalStatus::Escalated);

        let repeated = router.escalate(&mut chain, &first, past_due).unwrap();
        assert_eq!(repeated, EscalationOutcome::Unchanged);

        // The escalated step is still the chain's current step and stays
        // completable.
        assert_eq!(current_open_step(&deal.id, &chain).unwrap().id, first);
        let completed = router
            .complete(&mut deal, &mut chain, &first, &ApprovalDecision::approve("fin-1"), past_due)
            .unwrap();
        assert_eq!(completed, ChainOutcome::AwaitingNext);
    }

    #[test]
    fn escalation_leaves_steps_within_sla_alone() {
        let router = router();
        let deal = deal_in(DealStage::FinanceReview);
        let mut chain = two_step_chain(&deal, &router);
        let first = chain[0].id.clone();

        let outcome = router.escalate(&mut chain, &first, now() + Duration::hours(1)).unwrap();
        assert_eq!(outcome, EscalationOutcome::Unchanged);
        assert_eq!(chain[0].status, ApprovalStatus::Pending);
    }

    #[test]
    fn escalation_ignores_resolved_steps() {
        let router = router();
        let mut deal = deal_in(DealStage::FinanceReview);
        let mut chain = two_step_chain(&deal, &router);
        let first = chain[0].id.clone();

        router
            .complete(&mut deal, &mut chain, &first, &ApprovalDecision::approve("fin-1"), now())
            .unwrap();
        let outcome = router.escalate(&mut chain, &first, now() + Duration::days(7)).unwrap();
        assert_eq!(outcome, EscalationOutcome::Unchanged);
        assert_eq!(chain[0].status, ApprovalStatus::Approved);
    }

    #[test]
    fn overdue_listing_returns_open_past_due_steps_oldest_first() {
        let router = router();
        let deal = deal_in(DealStage::FinanceReview);
        let mut chain = two_step_chain(&deal, &router);
        chain[1].due_at = now() + Duration::hours(12);

        let at = now() + Duration::hours(30);
        let overdue = overdue_steps(&chain, at);

        assert_eq!(overdue.len(), 2);
        assert_eq!(overdue[0].id, chain[1].id);
        assert_eq!(overdue[1].id, chain[0].id);

        assert!(overdue_steps(&chain, now()).is_empty());
    }
}
