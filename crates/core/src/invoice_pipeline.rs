use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::InvoicingConfig;
use crate::domain::deal::{Deal, DealId, DealStage};
use crate::domain::invoice::{
    invoice_number, AccountingSystem, Invoice, InvoiceId, InvoiceStaging, InvoiceStagingId,
    InvoiceStagingStatus, StagingLineItem, StagingTax,
};
use crate::errors::{AdapterError, ApplicationError, DomainError};
use crate::idempotency_guard::{
    derive_operation_key, fingerprint_payload, BeginOutcome, InMemoryIdempotencyGuard,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StagingError {
    #[error("invoice staging cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: InvoiceStagingStatus, to: InvoiceStagingStatus },
    #[error("unknown invoice staging `{staging_id}`")]
    UnknownStaging { staging_id: InvoiceStagingId },
    #[error("deal `{deal_id}` is not closed won; only won deals are invoiced")]
    DealNotClosedWon { deal_id: DealId },
    #[error("staged totals are inconsistent: {details}")]
    InconsistentTotals { details: String },
}

/// Posts an approved invoice to an external accounting system and returns
/// its external invoice id. Implementations own their transport retries;
/// the pipeline only sees the final classified outcome.
#[async_trait]
pub trait AccountingAdapter: Send + Sync {
    fn system(&self) -> AccountingSystem;

    async fn post_invoice(&self, staging: &InvoiceStaging) -> Result<String, AdapterError>;
}

/// Scriptable stand-in for an accounting system. Posts succeed with a
/// synthetic external id unless a failure has been queued up.
pub struct InMemoryAccountingAdapter {
    system: AccountingSystem,
    failures: Mutex<VecDeque<AdapterError>>,
    posted: Mutex<Vec<String>>,
}

impl InMemoryAccountingAdapter {
    pub fn new(system: AccountingSystem) -> Self {
        Self { system, failures: Mutex::new(VecDeque::new()), posted: Mutex::new(Vec::new()) }
    }

    /// Queues a failure for the next post call.
    pub fn push_failure(&self, error: AdapterError) {
        match self.failures.lock() {
            Ok(mut failures) => failures.push_back(error),
            Err(poisoned) => poisoned.into_inner().push_back(error),
        }
    }

    /// Invoice numbers that reached the fake system, in call order.
    pub fn posted_invoice_numbers(&self) -> Vec<String> {
        match self.posted.lock() {
            Ok(posted) => posted.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AccountingAdapter for InMemoryAccountingAdapter {
    fn system(&self) -> AccountingSystem {
        self.system
    }

    async fn post_invoice(&self, staging: &InvoiceStaging) -> Result<String, AdapterError> {
        let queued = match self.failures.lock() {
            Ok(mut failures) => failures.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        if let Some(error) = queued {
            return Err(error);
        }

        match self.posted.lock() {
            Ok(mut posted) => posted.push(staging.invoice_number.clone()),
            Err(poisoned) => poisoned.into_inner().push(staging.invoice_number.clone()),
        }
        Ok(format!("{}-{}", self.system.as_str(), staging.invoice_number))
    }
}

/// Result of a staging request. Replays and concurrent callers always land
/// on the one existing draft.
#[derive(Clone, Debug, PartialEq)]
pub enum StageOutcome {
    Drafted(InvoiceStaging),
    Replayed(InvoiceStaging),
    InFlight { lease_expires_at: DateTime<Utc> },
}

#[derive(Clone, Debug, PartialEq)]
pub enum PostOutcome {
    Posted(Invoice),
    Replayed(Invoice),
    InFlight { lease_expires_at: DateTime<Utc> },
}

/// Deterministic staging math: line items from the deal, sales tax at the
/// configured rate, totals, and the date-scoped invoice number. Pure; the
/// caller supplies the per-day sequence.
pub fn build_staged_invoice(
    deal: &Deal,
    idempotency_key: &str,
    config: &InvoicingConfig,
    target: AccountingSystem,
    sequence: u32,
    now: DateTime<Utc>,
) -> InvoiceStaging {
    let mut line_items = vec![StagingLineItem {
        line_number: 1,
        sku: "SRV-001".to_string(),
        description: format!("Professional Services - {}", deal.name),
        quantity: Decimal::ONE,
        unit_price: deal.amount,
        line_total: deal.amount,
    }];
    if deal.operational_cost > Decimal::ZERO {
        line_items.push(StagingLineItem {
            line_number: 2,
            sku: "OPS-001".to_string(),
            description: "Operational & Infrastructure Costs".to_string(),
            quantity: Decimal::ONE,
            unit_price: deal.operational_cost,
            line_total: deal.operational_cost,
        });
    }

    let subtotal: Decimal = line_items.iter().map(|line| line.line_total).sum();
    let tax_amount = (subtotal * config.default_tax_rate / Decimal::ONE_HUNDRED).round_dp(2);
    let taxes = vec![StagingTax {
        tax_name: "Sales Tax".to_string(),
        tax_rate: config.default_tax_rate,
        taxable_amount: subtotal,
        tax_amount,
        jurisdiction: config.tax_jurisdiction.clone(),
    }];

    let invoice_date = now.date_naive();
    InvoiceStaging {
        id: InvoiceStagingId(Uuid::new_v4().to_string()),
        deal_id: deal.id.clone(),
        invoice_number: invoice_number(&config.numbering_prefix, invoice_date, sequence),
        idempotency_key: idempotency_key.to_string(),
        status: InvoiceStagingStatus::Draft,
        subtotal,
        tax_amount,
        total_amount: subtotal + tax_amount,
        currency: deal.currency.clone(),
        invoice_date,
        due_date: invoice_date + Duration::days(i64::from(deal.payment_terms_days)),
        payment_terms_days: deal.payment_terms_days,
        target_accounting_system: target,
        line_items,
        taxes,
        validation_errors: Vec::new(),
        rejection_reason: None,
        created_at: now,
        updated_at: now,
    }
}

fn transition(
    row: &mut InvoiceStaging,
    next: InvoiceStagingStatus,
    now: DateTime<Utc>,
) -> Result<(), StagingError> {
    if !row.status.can_transition_to(next) {
        return Err(StagingError::InvalidTransition { from: row.status, to: next });
    }
    row.status = next;
    row.updated_at = now;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct StageReceipt {
    staging_id: String,
}

#[derive(Debug, Deserialize)]
struct PostReceipt {
    invoice_id: String,
}

#[derive(Default)]
struct PipelineState {
    stagings: Vec<InvoiceStaging>,
    invoices: Vec<Invoice>,
}

impl PipelineState {
    fn staging_index(&self, id: &InvoiceStagingId) -> Result<usize, StagingError> {
        self.stagings
            .iter()
            .position(|row| row.id == *id)
            .ok_or_else(|| StagingError::UnknownStaging { staging_id: id.clone() })
    }
}

/// Drives deal closures into posted invoices: one guarded draft per trigger
/// event, a reviewed staging lifecycle, and a guarded post that cannot hit
/// the accounting system twice.
pub struct InvoicePipeline {
    config: InvoicingConfig,
    target: AccountingSystem,
    guard: Arc<InMemoryIdempotencyGuard>,
    adapter: Arc<dyn AccountingAdapter>,
    state: Mutex<PipelineState>,
}

impl InvoicePipeline {
    pub fn new(
        config: InvoicingConfig,
        target: AccountingSystem,
        guard: Arc<InMemoryIdempotencyGuard>,
        adapter: Arc<dyn AccountingAdapter>,
    ) -> Self {
        Self { config, target, guard, adapter, state: Mutex::new(PipelineState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stages a draft invoice for a closed-won deal. The operation key is
    /// derived from the deal and the triggering event, so reruns of the
    /// same trigger land on the existing draft instead of minting another.
    pub fn stage(
        &self,
        deal: &Deal,
        trigger_event_id: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome, DomainError> {
        let key = derive_operation_key(&deal.id.0, trigger_event_id);
        let fingerprint = fingerprint_payload(&serde_json::json!({
            "deal_id": deal.id.0,
            "trigger_event_id": trigger_event_id,
            "amount": deal.amount.to_string(),
            "operational_cost": deal.operational_cost.to_string(),
            "currency": deal.currency,
        }));

        match self.guard.begin(&key, &fingerprint, correlation_id, now)? {
            BeginOutcome::Proceed { .. } => {
                if deal.stage != DealStage::ClosedWon {
                    let error = StagingError::DealNotClosedWon { deal_id: deal.id.clone() };
                    self.guard.release(&key, &error.to_string(), now)?;
                    return Err(error.into());
                }

                let mut state = self.state();
                let today = now.date_naive();
                let sequence = state
                    .stagings
                    .iter()
                    .filter(|row| row.created_at.date_naive() == today)
                    .count() as u32
                    + 1;
                let row =
                    build_staged_invoice(deal, &key, &self.config, self.target, sequence, now);

                let inconsistencies = row.consistency_errors();
                if !inconsistencies.is_empty() {
                    drop(state);
                    let error =
                        StagingError::InconsistentTotals { details: inconsistencies.join("; ") };
                    self.guard.release(&key, &error.to_string(), now)?;
                    return Err(error.into());
                }

                state.stagings.push(row.clone());
                drop(state);

                let receipt = serde_json::json!({ "staging_id": row.id.0 }).to_string();
                self.guard.complete(&key, &receipt, now)?;
                Ok(StageOutcome::Drafted(row))
            }
            BeginOutcome::Cached { result } => {
                let receipt: StageReceipt = serde_json::from_str(&result).map_err(|_| {
                    DomainError::Validation("stored staging receipt is unreadable".to_owned())
                })?;
                let staging_id = InvoiceStagingId(receipt.staging_id);
                let state = self.state();
                let index = state.staging_index(&staging_id).map_err(DomainError::from)?;
                Ok(StageOutcome::Replayed(state.stagings[index].clone()))
            }
            BeginOutcome::InProgress { lease_expires_at } => {
                // Another worker holds the lease. If its draft is already
                // visible, hand that back; otherwise the caller waits.
                let state = self.state();
                match state.stagings.iter().find(|row| row.idempotency_key == key) {
                    Some(row) => Ok(StageOutcome::Replayed(row.clone())),
                    None => Ok(StageOutcome::InFlight { lease_expires_at }),
                }
            }
        }
    }

    pub fn submit(
        &self,
        staging_id: &InvoiceStagingId,
        now: DateTime<Utc>,
    ) -> Result<InvoiceStaging, DomainError> {
        let mut state = self.state();
        let index = state.staging_index(staging_id)?;
        transition(&mut state.stagings[index], InvoiceStagingStatus::Submitted, now)?;
        Ok(state.stagings[index].clone())
    }

    pub fn approve(
        &self,
        staging_id: &InvoiceStagingId,
        now: DateTime<Utc>,
    ) -> Result<InvoiceStaging, DomainError> {
        let mut state = self.state();
        let index = state.staging_index(staging_id)?;
        transition(&mut state.stagings[index], InvoiceStagingStatus::Approved, now)?;
        Ok(state.stagings[index].clone())
    }

    pub fn reject(
        &self,
        staging_id: &InvoiceStagingId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<InvoiceStaging, DomainError> {
        let mut state = self.state();
        let index = state.staging_index(staging_id)?;
        transition(&mut state.stagings[index], InvoiceStagingStatus::Rejected, now)?;
        state.stagings[index].rejection_reason = Some(reason.to_string());
        Ok(state.stagings[index].clone())
    }

    /// Posts an approved staging to the accounting system under a guarded
    /// `post:<staging>:<system>` key. Failure demotes the staging back to
    /// submitted and releases the lease, so a later approve + post retry
    /// reuses the same key and can never double-post.
    pub async fn post(
        &self,
        staging_id: &InvoiceStagingId,
        posted_by: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<PostOutcome, ApplicationError> {
        let row = {
            let state = self.state();
            let index = state.staging_index(staging_id).map_err(DomainError::from)?;
            state.stagings[index].clone()
        };

        let key = format!("post:{}:{}", row.id, row.target_accounting_system.as_str());
        let fingerprint = fingerprint_payload(&serde_json::json!({
            "staging_id": row.id.0,
            "invoice_number": row.invoice_number,
            "total_amount": row.total_amount.to_string(),
            "currency": row.currency,
        }));

        match self
            .guard
            .begin(&key, &fingerprint, correlation_id, now)
            .map_err(DomainError::from)?
        {
            BeginOutcome::Proceed { .. } => {
                if row.status != InvoiceStagingStatus::Approved {
                    let error = StagingError::InvalidTransition {
                        from: row.status,
                        to: InvoiceStagingStatus::Posted,
                    };
                    self.guard
                        .release(&key, &error.to_string(), now)
                        .map_err(DomainError::from)?;
                    return Err(DomainError::from(error).into());
                }

                match self.adapter.post_invoice(&row).await {
                    Ok(external_invoice_id) => {
                        let invoice =
                            self.record_posted(&row.id, external_invoice_id, posted_by, now)?;
                        let receipt =
                            serde_json::json!({ "invoice_id": invoice.id.0 }).to_string();
                        self.guard.complete(&key, &receipt, now).map_err(DomainError::from)?;
                        Ok(PostOutcome::Posted(invoice))
                    }
                    Err(error) => {
                        self.record_post_failure(&row.id, &error, now)?;
                        self.guard
                            .release(&key, &error.to_string(), now)
                            .map_err(DomainError::from)?;
                        Err(error.into())
                    }
                }
            }
            BeginOutcome::Cached { result } => {
                let receipt: PostReceipt = serde_json::from_str(&result).map_err(|_| {
                    DomainError::Validation("stored posting receipt is unreadable".to_owned())
                })?;
                let state = self.state();
                let invoice = state
                    .invoices
                    .iter()
                    .find(|invoice| invoice.id.0 == receipt.invoice_id)
                    .cloned()
                    .ok_or_else(|| {
                        DomainError::Validation(format!(
                            "posted invoice `{}` is missing",
                            receipt.invoice_id
                        ))
                    })?;
                Ok(PostOutcome::Replayed(invoice))
            }
            BeginOutcome::InProgress { lease_expires_at } => {
                Ok(PostOutcome::InFlight { lease_expires_at })
            }
        }
    }

    fn record_posted(
        &self,
        staging_id: &InvoiceStagingId,
        external_invoice_id: String,
        posted_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Invoice, DomainError> {
        let mut state = self.state();
        let index = state.staging_index(staging_id)?;
        transition(&mut state.stagings[index], InvoiceStagingStatus::Posted, now)?;
        let row = state.stagings[index].clone();

        let invoice = Invoice {
            id: InvoiceId(Uuid::new_v4().to_string()),
            staging_id: row.id.clone(),
            deal_id: row.deal_id.clone(),
            invoice_number: row.invoice_number.clone(),
            accounting_system: row.target_accounting_system,
            external_invoice_id,
            subtotal: row.subtotal,
            tax_amount: row.tax_amount,
            total_amount: row.total_amount,
            currency: row.currency.clone(),
            posted_at: now,
            posted_by: posted_by.to_string(),
            staging_snapshot: serde_json::to_value(&row).unwrap_or(serde_json::Value::Null),
        };
        state.invoices.push(invoice.clone());
        Ok(invoice)
    }

    fn record_post_failure(
        &self,
        staging_id: &InvoiceStagingId,
        error: &AdapterError,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut state = self.state();
        let index = state.staging_index(staging_id)?;
        transition(&mut state.stagings[index], InvoiceStagingStatus::Submitted, now)?;
        state.stagings[index].validation_errors =
            vec![format!("post to {} failed: {}", error.system(), error)];
        Ok(())
    }

    pub fn staging(&self, staging_id: &InvoiceStagingId) -> Option<InvoiceStaging> {
        let state = self.state();
        state.stagings.iter().find(|row| row.id == *staging_id).cloned()
    }

    pub fn stagings_for(&self, deal_id: &DealId) -> Vec<InvoiceStaging> {
        let state = self.state();
        state.stagings.iter().filter(|row| row.deal_id == *deal_id).cloned().collect()
    }

    pub fn invoices(&self) -> Vec<Invoice> {
        self.state().invoices.clone()
    }
}
