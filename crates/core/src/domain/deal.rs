use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DealId(pub String);

impl std::fmt::Display for DealId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    Prospecting,
    Qualification,
    Solutioning,
    Pricing,
    LegalReview,
    FinanceReview,
    ExecutiveApproval,
    ClosedWon,
    ClosedLost,
}

impl DealStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prospecting => "prospecting",
            Self::Qualification => "qualification",
            Self::Solutioning => "solutioning",
            Self::Pricing => "pricing",
            Self::LegalReview => "legal_review",
            Self::FinanceReview => "finance_review",
            Self::ExecutiveApproval => "executive_approval",
            Self::ClosedWon => "closed_won",
            Self::ClosedLost => "closed_lost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "prospecting" => Some(Self::Prospecting),
            "qualification" => Some(Self::Qualification),
            "solutioning" => Some(Self::Solutioning),
            "pricing" => Some(Self::Pricing),
            "legal_review" => Some(Self::LegalReview),
            "finance_review" => Some(Self::FinanceReview),
            "executive_approval" => Some(Self::ExecutiveApproval),
            "closed_won" => Some(Self::ClosedWon),
            "closed_lost" => Some(Self::ClosedLost),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ClosedWon | Self::ClosedLost)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailStatus {
    Pass,
    Violated,
}

impl GuardrailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Violated => "violated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pass" => Some(Self::Pass),
            "violated" => Some(Self::Violated),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StageTransitionError {
    #[error("invalid deal transition from {from:?} to {to:?}")]
    InvalidTransition { from: DealStage, to: DealStage },
    #[error("cannot close won while guardrails are violated")]
    GuardrailBlocked,
}

/// The pricing-relevant slice of a deal. This is the evaluator input: any
/// change to one of these fields requires a fresh guardrail verdict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DealTerms {
    pub amount: Decimal,
    pub currency: String,
    pub discount_percent: Decimal,
    pub payment_terms_days: u32,
    pub risk: RiskTier,
    pub segment: Option<String>,
}

impl DealTerms {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.amount < Decimal::ZERO {
            return Err(DomainError::Validation("amount must not be negative".to_owned()));
        }
        if self.discount_percent < Decimal::ZERO || self.discount_percent > Decimal::from(100) {
            return Err(DomainError::Validation(
                "discount_percent must be between 0 and 100".to_owned(),
            ));
        }
        if self.currency.trim().is_empty() {
            return Err(DomainError::Validation("currency is required".to_owned()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deal {
    pub id: DealId,
    pub name: String,
    pub amount: Decimal,
    pub currency: String,
    pub discount_percent: Decimal,
    pub payment_terms_days: u32,
    pub risk: RiskTier,
    pub segment: Option<String>,
    pub stage: DealStage,
    pub guardrail_status: GuardrailStatus,
    pub guardrail_reason: Option<String>,
    pub guardrail_locked: bool,
    pub operational_cost: Decimal,
    pub quote_generated_at: Option<DateTime<Utc>>,
    pub agreement_signed_at: Option<DateTime<Utc>>,
    pub payment_collected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn pricing_terms(&self) -> DealTerms {
        DealTerms {
            amount: self.amount,
            currency: self.currency.clone(),
            discount_percent: self.discount_percent,
            payment_terms_days: self.payment_terms_days,
            risk: self.risk,
            segment: self.segment.clone(),
        }
    }

    pub fn can_transition_to(&self, next: DealStage) -> bool {
        if self.stage == next {
            return true;
        }
        matches!(
            (self.stage, next),
            (DealStage::Prospecting, DealStage::Qualification)
                | (DealStage::Qualification, DealStage::Solutioning)
                | (DealStage::Qualification, DealStage::Pricing)
                | (DealStage::Solutioning, DealStage::Pricing)
                | (DealStage::Pricing, DealStage::LegalReview)
                | (DealStage::Pricing, DealStage::FinanceReview)
                | (DealStage::LegalReview, DealStage::ExecutiveApproval)
                | (DealStage::LegalReview, DealStage::FinanceReview)
                | (DealStage::LegalReview, DealStage::ClosedLost)
                | (DealStage::FinanceReview, DealStage::ExecutiveApproval)
                | (DealStage::FinanceReview, DealStage::ClosedLost)
                | (DealStage::ExecutiveApproval, DealStage::ClosedWon)
                | (DealStage::ExecutiveApproval, DealStage::ClosedLost)
        )
    }

    /// Advance the deal one stage. Re-entering the current stage is an
    /// idempotent no-op. Closing won is refused while guardrails are
    /// violated. Milestone timestamps are stamped on first entry only.
    pub fn transition_to(
        &mut self,
        next: DealStage,
        now: DateTime<Utc>,
    ) -> Result<(), StageTransitionError> {
        if self.stage == next {
            return Ok(());
        }
        if !self.can_transition_to(next) {
            return Err(StageTransitionError::InvalidTransition { from: self.stage, to: next });
        }
        if next == DealStage::ClosedWon && self.guardrail_status == GuardrailStatus::Violated {
            return Err(StageTransitionError::GuardrailBlocked);
        }

        self.stage = next;
        self.updated_at = now;
        match next {
            DealStage::Pricing => {
                self.quote_generated_at.get_or_insert(now);
            }
            DealStage::ExecutiveApproval => {
                self.agreement_signed_at.get_or_insert(now);
            }
            DealStage::ClosedWon => {
                self.payment_collected_at.get_or_insert(now);
            }
            _ => {}
        }
        Ok(())
    }

    /// Administrative reversal used when an approval step is rejected. Only
    /// review stages can fall back to pricing.
    pub fn revert_to_pricing(&mut self, now: DateTime<Utc>) -> Result<(), StageTransitionError> {
        match self.stage {
            DealStage::Pricing => Ok(()),
            DealStage::LegalReview | DealStage::FinanceReview | DealStage::ExecutiveApproval => {
                self.stage = DealStage::Pricing;
                self.updated_at = now;
                Ok(())
            }
            from => Err(StageTransitionError::InvalidTransition { from, to: DealStage::Pricing }),
        }
    }
}
