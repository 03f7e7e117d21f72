use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::deal::DealId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

impl std::fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A step in a deal's approval chain. Ordering matters: finance review
/// always precedes executive approval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStep {
    FinanceReview,
    ExecutiveApproval,
}

impl ApprovalStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FinanceReview => "finance_review",
            Self::ExecutiveApproval => "executive_approval",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "finance_review" => Some(Self::FinanceReview),
            "executive_approval" => Some(Self::ExecutiveApproval),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "escalated" => Some(Self::Escalated),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Escalated steps are still awaiting a decision; they remain the
    /// current step of their chain.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Escalated)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub deal_id: DealId,
    pub step: ApprovalStep,
    pub sequence_order: u32,
    pub status: ApprovalStatus,
    pub approver_id: Option<String>,
    pub notes: Option<String>,
    pub due_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && now > self.due_at
    }
}
