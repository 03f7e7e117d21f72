use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::deal::DealId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceStagingId(pub String);

impl std::fmt::Display for InvoiceStagingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceId(pub String);

impl std::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountingSystem {
    QuickBooks,
    Xero,
    NetSuite,
}

impl AccountingSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuickBooks => "quickbooks",
            Self::Xero => "xero",
            Self::NetSuite => "netsuite",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "quickbooks" => Some(Self::QuickBooks),
            "xero" => Some(Self::Xero),
            "netsuite" => Some(Self::NetSuite),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStagingStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
    Posted,
}

impl InvoiceStagingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Posted => "posted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "posted" => Some(Self::Posted),
            _ => None,
        }
    }

    /// Forward lifecycle plus the single allowed demotion: a failed post
    /// sends an approved staging back to submitted for re-review.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Submitted)
                | (Self::Submitted, Self::Approved)
                | (Self::Submitted, Self::Rejected)
                | (Self::Approved, Self::Posted)
                | (Self::Approved, Self::Submitted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Posted | Self::Rejected)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagingLineItem {
    pub line_number: u32,
    pub sku: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagingTax {
    pub tax_name: String,
    pub tax_rate: Decimal,
    pub taxable_amount: Decimal,
    pub tax_amount: Decimal,
    pub jurisdiction: String,
}

/// Mutable staging row a draft invoice moves through before posting. Rows
/// are never deleted; failed validation and rejection reasons live on the
/// row itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvoiceStaging {
    pub id: InvoiceStagingId,
    pub deal_id: DealId,
    pub invoice_number: String,
    pub idempotency_key: String,
    pub status: InvoiceStagingStatus,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub payment_terms_days: u32,
    pub target_accounting_system: AccountingSystem,
    pub line_items: Vec<StagingLineItem>,
    pub taxes: Vec<StagingTax>,
    pub validation_errors: Vec<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Largest tolerated rounding drift between money totals.
pub const TOTALS_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

impl InvoiceStaging {
    /// Internal consistency checks: line math, line sum vs subtotal, and
    /// subtotal + tax vs total, all within [`TOTALS_EPSILON`].
    pub fn consistency_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for line in &self.line_items {
            let expected = line.quantity * line.unit_price;
            if (expected - line.line_total).abs() > TOTALS_EPSILON {
                errors.push(format!(
                    "line {} total {} does not match quantity x unit price {}",
                    line.line_number, line.line_total, expected
                ));
            }
        }

        let line_sum: Decimal = self.line_items.iter().map(|line| line.line_total).sum();
        if (line_sum - self.subtotal).abs() > TOTALS_EPSILON {
            errors.push(format!(
                "line totals {} do not sum to subtotal {}",
                line_sum, self.subtotal
            ));
        }

        let computed_total = self.subtotal + self.tax_amount;
        if (computed_total - self.total_amount).abs() > TOTALS_EPSILON {
            errors.push(format!(
                "subtotal {} plus tax {} does not equal total {}",
                self.subtotal, self.tax_amount, self.total_amount
            ));
        }

        errors
    }
}

/// Immutable record of a posted invoice. Amounts are frozen at post time; a
/// snapshot of the staging row rides along for audit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub staging_id: InvoiceStagingId,
    pub deal_id: DealId,
    pub invoice_number: String,
    pub accounting_system: AccountingSystem,
    pub external_invoice_id: String,
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total_amount: Decimal,
    pub currency: String,
    pub posted_at: DateTime<Utc>,
    pub posted_by: String,
    pub staging_snapshot: serde_json::Value,
}

/// Invoice numbers are sequential per UTC day: `INV-YYYYMMDD-XXXXX`.
pub fn invoice_number(prefix: &str, date: NaiveDate, sequence: u32) -> String {
    format!("{}-{}-{:05}", prefix, date.format("%Y%m%d"), sequence)
}
