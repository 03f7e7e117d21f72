use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::GuardrailConfig;
use crate::domain::approval::ApprovalStep;
use crate::domain::deal::{Deal, DealTerms, GuardrailStatus};
use crate::domain::policy::{
    DiscountRules, PaymentTermsRules, Policy, PolicyConfiguration, PolicyId, PriceFloorRules,
};

/// Consistent view of the active policy set at one instant. Evaluation and
/// simulation both run against a snapshot, never against live storage.
#[derive(Clone, Debug, Default)]
pub struct PolicySnapshot {
    pub policies: Vec<Policy>,
    pub taken_at: DateTime<Utc>,
}

impl PolicySnapshot {
    pub fn new(policies: Vec<Policy>, taken_at: DateTime<Utc>) -> Self {
        Self { policies, taken_at }
    }

    /// Active policies that apply to the given segment, ordered by priority
    /// (descending), then narrower scope before wildcard, then most recent
    /// activation.
    pub fn candidates_for(&self, segment: Option<&str>, now: DateTime<Utc>) -> Vec<&Policy> {
        let mut candidates: Vec<&Policy> = self
            .policies
            .iter()
            .filter(|policy| policy.is_active_at(now) && policy.scope.applies_to(segment))
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| b.scope.specificity().cmp(&a.scope.specificity()))
                .then_with(|| b.activated_at.cmp(&a.activated_at))
        });

        candidates
    }

    /// Snapshot with `proposed` standing in for any active policy of the same
    /// (type, scope). The proposed policy is treated as active for the run so
    /// that not-yet-activated drafts can be previewed.
    pub fn with_substitution(&self, proposed: &Policy) -> PolicySnapshot {
        use crate::domain::policy::PolicyStatus;

        let key = proposed.exclusivity_key();
        let mut policies: Vec<Policy> = self
            .policies
            .iter()
            .filter(|policy| policy.exclusivity_key() != key)
            .cloned()
            .collect();

        let mut substituted = proposed.clone();
        substituted.status = PolicyStatus::Active;
        if substituted.activated_at.is_none() {
            substituted.activated_at = Some(self.taken_at);
        }
        policies.push(substituted);

        PolicySnapshot { policies, taken_at: self.taken_at }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailCheck {
    DiscountLimit,
    PriceFloor,
    PaymentTerms,
}

impl GuardrailCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DiscountLimit => "discount_limit",
            Self::PriceFloor => "price_floor",
            Self::PaymentTerms => "payment_terms",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuardrailViolation {
    pub check: GuardrailCheck,
    /// Policy that decided the verdict; `None` when a built-in default fired.
    pub policy_id: Option<PolicyId>,
    pub policy_name: Option<String>,
    pub reason: String,
    pub observed: Decimal,
    pub limit: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub status: GuardrailStatus,
    pub violations: Vec<GuardrailViolation>,
    /// Approval chain to route. May be non-empty on a passing verdict when a
    /// policy attaches a soft review threshold.
    pub required_steps: Vec<ApprovalStep>,
    pub evaluated_at: DateTime<Utc>,
}

impl GuardrailVerdict {
    pub fn pass(evaluated_at: DateTime<Utc>) -> Self {
        Self {
            status: GuardrailStatus::Pass,
            violations: Vec::new(),
            required_steps: Vec::new(),
            evaluated_at,
        }
    }

    pub fn is_pass(&self) -> bool {
        self.status == GuardrailStatus::Pass
    }

    pub fn reason(&self) -> Option<&str> {
        self.violations.first().map(|violation| violation.reason.as_str())
    }
}

struct PricingChecks<'a> {
    discount: Option<&'a DiscountRules>,
    floor: Option<&'a PriceFloorRules>,
    terms: Option<&'a PaymentTermsRules>,
}

fn pricing_checks(configuration: &PolicyConfiguration) -> PricingChecks<'_> {
    match configuration {
        PolicyConfiguration::Pricing(rules) => PricingChecks {
            discount: Some(&rules.discount_guardrails),
            floor: Some(&rules.price_floor),
            terms: Some(&rules.payment_terms_guardrails),
        },
        PolicyConfiguration::Discount(rules) => {
            PricingChecks { discount: Some(rules), floor: None, terms: None }
        }
        PolicyConfiguration::PriceFloor(rules) => {
            PricingChecks { discount: None, floor: Some(rules), terms: None }
        }
        PolicyConfiguration::PaymentTerms(rules) => {
            PricingChecks { discount: None, floor: None, terms: Some(rules) }
        }
        _ => PricingChecks { discount: None, floor: None, terms: None },
    }
}

/// Pure evaluation of deal pricing terms against a policy snapshot plus the
/// configured built-in limits.
#[derive(Clone, Debug)]
pub struct GuardrailEvaluator {
    limits: GuardrailConfig,
}

impl GuardrailEvaluator {
    pub fn new(limits: GuardrailConfig) -> Self {
        Self { limits }
    }

    pub fn evaluate(
        &self,
        terms: &DealTerms,
        snapshot: &PolicySnapshot,
        now: DateTime<Utc>,
    ) -> GuardrailVerdict {
        let candidates = snapshot.candidates_for(terms.segment.as_deref(), now);

        let mut discount_covered = false;
        let mut terms_covered = false;

        for policy in &candidates {
            let checks = pricing_checks(&policy.configuration);
            discount_covered |= checks.discount.is_some();
            terms_covered |= checks.terms.is_some();

            if let Some(mut violation) = self.first_breach(terms, &checks) {
                violation.policy_id = Some(policy.id.clone());
                violation.policy_name = Some(policy.name.clone());
                let steps = self.steps_for_breach(&violation, checks.discount);
                return GuardrailVerdict {
                    status: GuardrailStatus::Violated,
                    violations: vec![violation],
                    required_steps: steps,
                    evaluated_at: now,
                };
            }
        }

        // Built-in limits back any check no active policy spoke for.
        if !discount_covered {
            let ceiling = self.limits.risk_ceiling(terms.risk);
            if terms.discount_percent > ceiling {
                let violation = discount_violation(terms, ceiling);
                let steps = self.steps_for_breach(&violation, None);
                return GuardrailVerdict {
                    status: GuardrailStatus::Violated,
                    violations: vec![violation],
                    required_steps: steps,
                    evaluated_at: now,
                };
            }
        }

        if !terms_covered {
            let ceiling = self.limits.payment_terms_ceiling_days;
            if terms.payment_terms_days > ceiling {
                let violation = terms_violation(terms, ceiling);
                let steps = self.steps_for_breach(&violation, None);
                return GuardrailVerdict {
                    status: GuardrailStatus::Violated,
                    violations: vec![violation],
                    required_steps: steps,
                    evaluated_at: now,
                };
            }
        }

        let mut verdict = GuardrailVerdict::pass(now);
        verdict.required_steps = soft_review_steps(terms, &candidates);
        verdict
    }

    /// First failing check within one policy, in the fixed order discount
    /// ceiling, price floor, payment terms ceiling.
    fn first_breach(
        &self,
        terms: &DealTerms,
        checks: &PricingChecks<'_>,
    ) -> Option<GuardrailViolation> {
        if let Some(rules) = checks.discount {
            let ceiling = rules.ceiling_for(terms.risk);
            if terms.discount_percent > ceiling {
                return Some(discount_violation(terms, ceiling));
            }
        }

        if let Some(rules) = checks.floor {
            if terms.currency == rules.currency && terms.amount < rules.min_amount {
                return Some(GuardrailViolation {
                    check: GuardrailCheck::PriceFloor,
                    policy_id: None,
                    policy_name: None,
                    reason: format!(
                        "amount ${:.2} is below configured floor ${:.2}",
                        terms.amount, rules.min_amount
                    ),
                    observed: terms.amount,
                    limit: rules.min_amount,
                });
            }
        }

        if let Some(rules) = checks.terms {
            if terms.payment_terms_days > rules.max_terms_days {
                return Some(terms_violation(terms, rules.max_terms_days));
            }
        }

        None
    }

    /// finance_review always; executive_approval once the breach reaches the
    /// configured fraction of the limit, or when the deciding discount rules
    /// carry an absolute executive threshold that the observed value passes.
    fn steps_for_breach(
        &self,
        violation: &GuardrailViolation,
        discount_rules: Option<&DiscountRules>,
    ) -> Vec<ApprovalStep> {
        let breach = match violation.check {
            GuardrailCheck::PriceFloor => violation.limit - violation.observed,
            _ => violation.observed - violation.limit,
        };

        let escalation_point = violation.limit * self.limits.secondary_escalation_threshold;
        let mut escalate = if violation.limit > Decimal::ZERO {
            breach >= escalation_point
        } else {
            breach > Decimal::ZERO
        };

        if violation.check == GuardrailCheck::DiscountLimit {
            if let Some(threshold) =
                discount_rules.and_then(|rules| rules.requires_executive_approval_above)
            {
                escalate |= violation.observed > threshold;
            }
        }

        let mut steps = vec![ApprovalStep::FinanceReview];
        if escalate {
            steps.push(ApprovalStep::ExecutiveApproval);
        }
        steps
    }
}

/// Writes the verdict onto the deal's guardrail fields. A locked deal has
/// cleared its approval chain and is not re-stamped.
pub fn apply_verdict(deal: &mut Deal, verdict: &GuardrailVerdict) {
    if deal.guardrail_locked {
        return;
    }

    deal.guardrail_status = verdict.status;
    deal.guardrail_reason = verdict.reason().map(str::to_owned);
}

fn discount_violation(terms: &DealTerms, ceiling: Decimal) -> GuardrailViolation {
    GuardrailViolation {
        check: GuardrailCheck::DiscountLimit,
        policy_id: None,
        policy_name: None,
        reason: format!(
            "discount {:.1}% exceeds {:.1}% limit for {} risk",
            terms.discount_percent,
            ceiling,
            terms.risk.as_str()
        ),
        observed: terms.discount_percent,
        limit: ceiling,
    }
}

fn terms_violation(terms: &DealTerms, ceiling_days: u32) -> GuardrailViolation {
    GuardrailViolation {
        check: GuardrailCheck::PaymentTerms,
        policy_id: None,
        policy_name: None,
        reason: format!(
            "payment terms {} days exceed {} day limit",
            terms.payment_terms_days, ceiling_days
        ),
        observed: Decimal::from(terms.payment_terms_days),
        limit: Decimal::from(ceiling_days),
    }
}

/// Review steps attached to a passing verdict by policy soft thresholds. The
/// highest-ranked policy that defines a threshold decides it.
fn soft_review_steps(terms: &DealTerms, candidates: &[&Policy]) -> Vec<ApprovalStep> {
    let mut finance = false;
    let mut executive = false;

    for policy in candidates {
        let checks = pricing_checks(&policy.configuration);

        if !executive {
            if let Some(threshold) =
                checks.discount.and_then(|rules| rules.requires_executive_approval_above)
            {
                executive = terms.discount_percent > threshold;
            }
        }

        if !finance {
            if let Some(threshold) =
                checks.terms.and_then(|rules| rules.requires_finance_review_above_days)
            {
                finance = terms.payment_terms_days > threshold;
            }
        }
    }

    let mut steps = Vec::new();
    if finance {
        steps.push(ApprovalStep::FinanceReview);
    }
    if executive {
        steps.push(ApprovalStep::ExecutiveApproval);
    }
    steps
}
