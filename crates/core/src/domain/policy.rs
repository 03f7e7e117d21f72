use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::deal::RiskTier;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId(pub String);

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    Pricing,
    Discount,
    PaymentTerms,
    PriceFloor,
    ApprovalMatrix,
    Sla,
    Custom,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pricing => "pricing",
            Self::Discount => "discount",
            Self::PaymentTerms => "payment_terms",
            Self::PriceFloor => "price_floor",
            Self::ApprovalMatrix => "approval_matrix",
            Self::Sla => "sla",
            Self::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pricing" => Some(Self::Pricing),
            "discount" => Some(Self::Discount),
            "payment_terms" => Some(Self::PaymentTerms),
            "price_floor" => Some(Self::PriceFloor),
            "approval_matrix" => Some(Self::ApprovalMatrix),
            "sla" => Some(Self::Sla),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Draft,
    Active,
    Inactive,
    Archived,
    Superseded,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Archived => "archived",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "archived" => Some(Self::Archived),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }
}

/// Where a policy applies. Global policies match every deal; segment
/// policies match only deals tagged with the same segment. The scope key is
/// one leg of the (type, scope) uniqueness and locking domain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Global,
    Segment(String),
}

impl PolicyScope {
    pub fn as_key(&self) -> String {
        match self {
            Self::Global => "global".to_owned(),
            Self::Segment(name) => format!("segment:{name}"),
        }
    }

    pub fn parse_key(value: &str) -> Option<Self> {
        if value == "global" {
            return Some(Self::Global);
        }
        value.strip_prefix("segment:").map(|name| Self::Segment(name.to_owned()))
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Global)
    }

    /// Rank used when ordering candidate policies: narrower scopes beat the
    /// wildcard.
    pub fn specificity(&self) -> u8 {
        match self {
            Self::Global => 0,
            Self::Segment(_) => 1,
        }
    }

    pub fn applies_to(&self, deal_segment: Option<&str>) -> bool {
        match self {
            Self::Global => true,
            Self::Segment(name) => deal_segment == Some(name.as_str()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscountRules {
    pub default_max_discount_percent: Decimal,
    #[serde(default)]
    pub risk_overrides: BTreeMap<RiskTier, Decimal>,
    /// Absolute discount above which executive approval is always required,
    /// regardless of the relative-excess escalation rule.
    #[serde(default)]
    pub requires_executive_approval_above: Option<Decimal>,
}

impl DiscountRules {
    pub fn ceiling_for(&self, risk: RiskTier) -> Decimal {
        self.risk_overrides.get(&risk).copied().unwrap_or(self.default_max_discount_percent)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentTermsRules {
    pub max_terms_days: u32,
    /// Terms above this (but within the ceiling) still pass, with a finance
    /// review attached.
    #[serde(default)]
    pub requires_finance_review_above_days: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceFloorRules {
    pub currency: String,
    pub min_amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlaRules {
    pub touch_rate_target: Decimal,
    pub response_time_threshold: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingRules {
    pub discount_guardrails: DiscountRules,
    pub payment_terms_guardrails: PaymentTermsRules,
    pub price_floor: PriceFloorRules,
}

/// Policy configuration as a tagged union keyed by policy type. Shapes are
/// checked at the type level; value ranges are checked by [`validate`].
///
/// [`validate`]: PolicyConfiguration::validate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfiguration {
    Pricing(PricingRules),
    Discount(DiscountRules),
    PaymentTerms(PaymentTermsRules),
    PriceFloor(PriceFloorRules),
    ApprovalMatrix { rules: serde_json::Value },
    Sla(SlaRules),
    Custom { rules: serde_json::Value },
}

impl PolicyConfiguration {
    pub fn policy_type(&self) -> PolicyType {
        match self {
            Self::Pricing(_) => PolicyType::Pricing,
            Self::Discount(_) => PolicyType::Discount,
            Self::PaymentTerms(_) => PolicyType::PaymentTerms,
            Self::PriceFloor(_) => PolicyType::PriceFloor,
            Self::ApprovalMatrix { .. } => PolicyType::ApprovalMatrix,
            Self::Sla(_) => PolicyType::Sla,
            Self::Custom { .. } => PolicyType::Custom,
        }
    }

    /// Range checks over an already well-shaped configuration. Returns every
    /// problem found, not just the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self {
            Self::Pricing(rules) => {
                validate_discount(&rules.discount_guardrails, &mut errors);
                validate_payment_terms(&rules.payment_terms_guardrails, &mut errors);
                validate_price_floor(&rules.price_floor, &mut errors);
            }
            Self::Discount(rules) => validate_discount(rules, &mut errors),
            Self::PaymentTerms(rules) => validate_payment_terms(rules, &mut errors),
            Self::PriceFloor(rules) => validate_price_floor(rules, &mut errors),
            Self::ApprovalMatrix { rules } => {
                if !rules.is_object() {
                    errors.push("Approval matrix rules must be an object".to_owned());
                }
            }
            Self::Sla(rules) => {
                if rules.touch_rate_target < Decimal::ZERO || rules.touch_rate_target > Decimal::ONE
                {
                    errors.push("Touch rate target must be between 0 and 1".to_owned());
                }
                if rules.response_time_threshold <= Decimal::ZERO {
                    errors.push("Response time threshold must be positive".to_owned());
                }
            }
            Self::Custom { rules } => {
                if !rules.is_object() {
                    errors.push("Custom rules must be an object".to_owned());
                }
            }
        }
        errors
    }
}

fn validate_discount(rules: &DiscountRules, errors: &mut Vec<String>) {
    let hundred = Decimal::from(100);
    if rules.default_max_discount_percent < Decimal::ZERO
        || rules.default_max_discount_percent > hundred
    {
        errors.push("Default max discount percent must be between 0 and 100".to_owned());
    }
    for (risk, ceiling) in &rules.risk_overrides {
        if *ceiling < Decimal::ZERO || *ceiling > hundred {
            errors.push(format!(
                "Risk override for {} must be between 0 and 100",
                risk.as_str()
            ));
        }
    }
}

fn validate_payment_terms(rules: &PaymentTermsRules, errors: &mut Vec<String>) {
    if rules.max_terms_days == 0 {
        errors.push("Max terms days must be positive".to_owned());
    }
}

fn validate_price_floor(rules: &PriceFloorRules, errors: &mut Vec<String>) {
    if rules.min_amount < Decimal::ZERO {
        errors.push("Minimum amount must be non-negative".to_owned());
    }
    if rules.currency.trim().is_empty() {
        errors.push("Price floor currency is required".to_owned());
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    /// Stable across every version of one policy; equals the first version's
    /// id.
    pub lineage_id: PolicyId,
    pub name: String,
    pub description: Option<String>,
    pub policy_type: PolicyType,
    pub status: PolicyStatus,
    pub version: u32,
    pub configuration: PolicyConfiguration,
    pub priority: i32,
    pub scope: PolicyScope,
    pub effective_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub parent_policy_id: Option<PolicyId>,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Serialization domain for activation and uniqueness: one active policy
    /// per (type, scope).
    pub fn exclusivity_key(&self) -> String {
        format!("{}:{}", self.policy_type.as_str(), self.scope.as_key())
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != PolicyStatus::Active {
            return false;
        }
        if let Some(effective_at) = self.effective_at {
            if now < effective_at {
                return false;
            }
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Overlap,
    Contradiction,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overlap => "overlap",
            Self::Contradiction => "contradiction",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "overlap" => Some(Self::Overlap),
            "contradiction" => Some(Self::Contradiction),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
}

impl ConflictSeverity {
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

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyConflict {
    pub id: String,
    pub first_policy_id: PolicyId,
    pub second_policy_id: PolicyId,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub description: String,
    pub resolution_suggestion: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyChangeType {
    Created,
    Updated,
    Activated,
    Deactivated,
    Superseded,
    RolledBack,
}

impl PolicyChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Activated => "activated",
            Self::Deactivated => "deactivated",
            Self::Superseded => "superseded",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "activated" => Some(Self::Activated),
            "deactivated" => Some(Self::Deactivated),
            "superseded" => Some(Self::Superseded),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

/// Append-only record of a policy lifecycle change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyChangeRecord {
    pub id: String,
    pub policy_id: PolicyId,
    pub change_type: PolicyChangeType,
    pub summary: String,
    pub old_configuration: Option<serde_json::Value>,
    pub new_configuration: Option<serde_json::Value>,
    pub changed_by: String,
    pub occurred_at: DateTime<Utc>,
}
