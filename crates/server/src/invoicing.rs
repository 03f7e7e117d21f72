//! Invoice staging routes.
//!
//! Staging is guarded per `(deal, trigger event)` so redelivered closure
//! events land on the existing draft. Posting is guarded per
//! `(staging, accounting system)`; a failed post demotes the staging back to
//! submitted and releases the lease, so the retry reuses the same key and
//! can never reach the accounting system twice.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use dealgate_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use dealgate_core::config::InvoicingConfig;
use dealgate_core::domain::deal::DealStage;
use dealgate_core::domain::event::event_types;
use dealgate_core::domain::invoice::{
    AccountingSystem, Invoice, InvoiceId, InvoiceStaging, InvoiceStagingId, InvoiceStagingStatus,
};
use dealgate_core::errors::DomainError;
use dealgate_core::idempotency_guard::{derive_operation_key, fingerprint_payload, BeginOutcome};
use dealgate_core::invoice_pipeline::{build_staged_invoice, AccountingAdapter, StagingError};
use dealgate_db::repositories::{
    DealRepository, InvoiceRepository, SqlDealRepository, SqlIdempotencyRepository,
    SqlInvoiceRepository,
};
use dealgate_db::DbPool;

use crate::accounting::post_with_retry;
use crate::api::{self, ErrorReply};

#[derive(Clone)]
pub struct InvoicingState {
    db_pool: DbPool,
    invoicing: InvoicingConfig,
    target: AccountingSystem,
    adapter: Arc<dyn AccountingAdapter>,
    lease_ttl: Duration,
}

#[derive(Debug, Deserialize)]
pub struct StageRequest {
    pub deal_id: String,
    pub trigger_event_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging: Option<InvoiceStaging>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct PostResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice: Option<Invoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct StageReceipt {
    staging_id: String,
}

#[derive(Debug, Deserialize)]
struct PostReceipt {
    invoice_id: String,
}

pub fn router(
    db_pool: DbPool,
    invoicing: InvoicingConfig,
    target: AccountingSystem,
    adapter: Arc<dyn AccountingAdapter>,
    lease_ttl: Duration,
) -> Router {
    Router::new()
        .route("/api/invoices/stage", post(stage_invoice))
        .route("/api/invoices/{staging_id}/submit", post(submit_staging))
        .route("/api/invoices/{staging_id}/approve", post(approve_staging))
        .route("/api/invoices/{staging_id}/reject", post(reject_staging))
        .route("/api/invoices/{staging_id}/post", post(post_staging))
        .with_state(InvoicingState { db_pool, invoicing, target, adapter, lease_ttl })
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

async fn load_staging(
    state: &InvoicingState,
    staging_id: &str,
    correlation_id: &str,
) -> Result<InvoiceStaging, ErrorReply> {
    SqlInvoiceRepository::new(state.db_pool.clone())
        .find_staging(&InvoiceStagingId(staging_id.to_string()))
        .await
        .map_err(|error| api::db_error(error, correlation_id))?
        .ok_or_else(|| api::not_found("invoice staging", staging_id, correlation_id))
}

async fn stage_invoice(
    State(state): State<InvoicingState>,
    Json(request): Json<StageRequest>,
) -> Result<Json<StageResponse>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    if request.trigger_event_id.trim().is_empty() {
        return Err(api::bad_request("trigger_event_id is required", &correlation_id));
    }

    let deal = SqlDealRepository::new(state.db_pool.clone())
        .find_by_id(&dealgate_core::domain::deal::DealId(request.deal_id.clone()))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .ok_or_else(|| api::not_found("deal", &request.deal_id, &correlation_id))?;

    let invoices = SqlInvoiceRepository::new(state.db_pool.clone());
    let guard = SqlIdempotencyRepository::new(state.db_pool.clone(), state.lease_ttl);

    let key = derive_operation_key(&deal.id.0, &request.trigger_event_id);
    let fingerprint = fingerprint_payload(&serde_json::json!({
        "deal_id": deal.id.0,
        "trigger_event_id": request.trigger_event_id,
        "amount": deal.amount.to_string(),
        "operational_cost": deal.operational_cost.to_string(),
        "currency": deal.currency,
    }));

    match guard
        .begin(&key, &fingerprint, &correlation_id, now)
        .await
        .map_err(|error| api::guard_error(error, &correlation_id))?
    {
        BeginOutcome::Proceed { .. } => {
            if deal.stage != DealStage::ClosedWon {
                let error = StagingError::DealNotClosedWon { deal_id: deal.id.clone() };
                guard
                    .release(&key, &error.to_string(), now)
                    .await
                    .map_err(|release| api::guard_error(release, &correlation_id))?;
                return Err(api::error_reply(DomainError::from(error).into(), &correlation_id));
            }

            let sequence = invoices
                .stagings_created_on(now.date_naive())
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?
                + 1;
            let row =
                build_staged_invoice(&deal, &key, &state.invoicing, state.target, sequence, now);

            let inconsistencies = row.consistency_errors();
            if !inconsistencies.is_empty() {
                let error =
                    StagingError::InconsistentTotals { details: inconsistencies.join("; ") };
                guard
                    .release(&key, &error.to_string(), now)
                    .await
                    .map_err(|release| api::guard_error(release, &correlation_id))?;
                return Err(api::error_reply(DomainError::from(error).into(), &correlation_id));
            }

            invoices
                .save_staging(row.clone())
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?;
            let receipt = serde_json::json!({ "staging_id": row.id.0 }).to_string();
            guard
                .complete(&key, &receipt, now)
                .await
                .map_err(|error| api::guard_error(error, &correlation_id))?;

            api::record_audit(
                &state.db_pool,
                AuditEvent::new(
                    Some(deal.id.clone()),
                    &correlation_id,
                    "invoice.staged",
                    AuditCategory::Invoice,
                    "invoice-pipeline",
                    AuditOutcome::Success,
                )
                .with_metadata("invoice_number", row.invoice_number.clone()),
            )
            .await;

            info!(
                event_name = "api.invoices.staged",
                correlation_id = %correlation_id,
                deal_id = %deal.id,
                staging_id = %row.id,
                invoice_number = %row.invoice_number,
                "invoice draft staged"
            );

            Ok(Json(StageResponse {
                outcome: "drafted",
                staging: Some(row),
                lease_expires_at: None,
            }))
        }
        BeginOutcome::Cached { result } => {
            let receipt: StageReceipt = serde_json::from_str(&result).map_err(|_| {
                api::error_reply(
                    DomainError::Validation("stored staging receipt is unreadable".to_owned())
                        .into(),
                    &correlation_id,
                )
            })?;
            let staging_id = InvoiceStagingId(receipt.staging_id);
            let row = invoices
                .find_staging(&staging_id)
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?
                .ok_or_else(|| {
                    api::error_reply(
                        DomainError::from(StagingError::UnknownStaging { staging_id }).into(),
                        &correlation_id,
                    )
                })?;
            Ok(Json(StageResponse {
                outcome: "replayed",
                staging: Some(row),
                lease_expires_at: None,
            }))
        }
        BeginOutcome::InProgress { lease_expires_at } => {
            // Another worker holds the lease. If its draft is already
            // visible, hand that back; otherwise the caller waits.
            match invoices
                .staging_by_key(&key)
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?
            {
                Some(row) => Ok(Json(StageResponse {
                    outcome: "replayed",
                    staging: Some(row),
                    lease_expires_at: None,
                })),
                None => Ok(Json(StageResponse {
                    outcome: "in_flight",
                    staging: None,
                    lease_expires_at: Some(lease_expires_at),
                })),
            }
        }
    }
}

async fn submit_staging(
    Path(staging_id): Path<String>,
    State(state): State<InvoicingState>,
) -> Result<Json<InvoiceStaging>, ErrorReply> {
    advance_staging(state, staging_id, InvoiceStagingStatus::Submitted, None).await
}

async fn approve_staging(
    Path(staging_id): Path<String>,
    State(state): State<InvoicingState>,
) -> Result<Json<InvoiceStaging>, ErrorReply> {
    advance_staging(state, staging_id, InvoiceStagingStatus::Approved, None).await
}

async fn reject_staging(
    Path(staging_id): Path<String>,
    State(state): State<InvoicingState>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<InvoiceStaging>, ErrorReply> {
    advance_staging(state, staging_id, InvoiceStagingStatus::Rejected, Some(request.reason)).await
}

async fn advance_staging(
    state: InvoicingState,
    staging_id: String,
    next: InvoiceStagingStatus,
    rejection_reason: Option<String>,
) -> Result<Json<InvoiceStaging>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    if next == InvoiceStagingStatus::Rejected
        && rejection_reason.as_deref().map_or(true, |reason| reason.trim().is_empty())
    {
        return Err(api::bad_request("reason is required", &correlation_id));
    }

    let mut row = load_staging(&state, &staging_id, &correlation_id).await?;
    transition(&mut row, next, now)
        .map_err(|error| api::error_reply(DomainError::from(error).into(), &correlation_id))?;
    if let Some(reason) = rejection_reason {
        row.rejection_reason = Some(reason);
    }

    SqlInvoiceRepository::new(state.db_pool.clone())
        .save_staging(row.clone())
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    info!(
        event_name = "api.invoices.status_changed",
        correlation_id = %correlation_id,
        staging_id = %row.id,
        status = row.status.as_str(),
        "invoice staging status changed"
    );

    Ok(Json(row))
}

async fn post_staging(
    Path(staging_id): Path<String>,
    State(state): State<InvoicingState>,
) -> Result<Json<PostResponse>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let row = load_staging(&state, &staging_id, &correlation_id).await?;
    let invoices = SqlInvoiceRepository::new(state.db_pool.clone());
    let guard = SqlIdempotencyRepository::new(state.db_pool.clone(), state.lease_ttl);

    let key = format!("post:{}:{}", row.id, row.target_accounting_system.as_str());
    let fingerprint = fingerprint_payload(&serde_json::json!({
        "staging_id": row.id.0,
        "invoice_number": row.invoice_number,
        "total_amount": row.total_amount.to_string(),
        "currency": row.currency,
    }));

    match guard
        .begin(&key, &fingerprint, &correlation_id, now)
        .await
        .map_err(|error| api::guard_error(error, &correlation_id))?
    {
        BeginOutcome::Proceed { .. } => {
            if row.status != InvoiceStagingStatus::Approved {
                let error = StagingError::InvalidTransition {
                    from: row.status,
                    to: InvoiceStagingStatus::Posted,
                };
                guard
                    .release(&key, &error.to_string(), now)
                    .await
                    .map_err(|release| api::guard_error(release, &correlation_id))?;
                return Err(api::error_reply(DomainError::from(error).into(), &correlation_id));
            }

            match post_with_retry(state.adapter.as_ref(), &row).await {
                Ok(external_invoice_id) => {
                    let invoice =
                        record_posted(&invoices, row, external_invoice_id, now, &correlation_id)
                            .await?;
                    let receipt = serde_json::json!({ "invoice_id": invoice.id.0 }).to_string();
                    guard
                        .complete(&key, &receipt, now)
                        .await
                        .map_err(|error| api::guard_error(error, &correlation_id))?;

                    api::enqueue_event(
                        &state.db_pool,
                        Some(invoice.deal_id.clone()),
                        event_types::INVOICE_POSTED,
                        serde_json::json!({
                            "invoice_id": invoice.id.0,
                            "deal_id": invoice.deal_id.0,
                            "invoice_number": invoice.invoice_number,
                            "total_amount": invoice.total_amount,
                            "currency": invoice.currency,
                        }),
                        now,
                    )
                    .await;

                    api::record_audit(
                        &state.db_pool,
                        AuditEvent::new(
                            Some(invoice.deal_id.clone()),
                            &correlation_id,
                            "invoice.posted",
                            AuditCategory::Invoice,
                            "invoice-pipeline",
                            AuditOutcome::Success,
                        )
                        .with_metadata("invoice_number", invoice.invoice_number.clone())
                        .with_metadata("external_invoice_id", invoice.external_invoice_id.clone()),
                    )
                    .await;

                    info!(
                        event_name = "api.invoices.posted",
                        correlation_id = %correlation_id,
                        deal_id = %invoice.deal_id,
                        invoice_id = %invoice.id.0,
                        external_invoice_id = %invoice.external_invoice_id,
                        "invoice posted to accounting"
                    );

                    Ok(Json(PostResponse {
                        outcome: "posted",
                        invoice: Some(invoice),
                        lease_expires_at: None,
                    }))
                }
                Err(error) => {
                    let mut demoted = row;
                    transition(&mut demoted, InvoiceStagingStatus::Submitted, now).map_err(
                        |transition| {
                            api::error_reply(
                                DomainError::from(transition).into(),
                                &correlation_id,
                            )
                        },
                    )?;
                    demoted.validation_errors =
                        vec![format!("post to {} failed: {}", error.system(), error)];
                    invoices
                        .save_staging(demoted.clone())
                        .await
                        .map_err(|save| api::db_error(save, &correlation_id))?;
                    guard
                        .release(&key, &error.to_string(), now)
                        .await
                        .map_err(|release| api::guard_error(release, &correlation_id))?;

                    api::record_audit(
                        &state.db_pool,
                        AuditEvent::new(
                            Some(demoted.deal_id.clone()),
                            &correlation_id,
                            "invoice.post_failed",
                            AuditCategory::Invoice,
                            "invoice-pipeline",
                            AuditOutcome::Failed,
                        )
                        .with_metadata("error", error.to_string()),
                    )
                    .await;

                    Err(api::error_reply(error.into(), &correlation_id))
                }
            }
        }
        BeginOutcome::Cached { result } => {
            let receipt: PostReceipt = serde_json::from_str(&result).map_err(|_| {
                api::error_reply(
                    DomainError::Validation("stored posting receipt is unreadable".to_owned())
                        .into(),
                    &correlation_id,
                )
            })?;
            let invoice = invoices
                .find_invoice(&InvoiceId(receipt.invoice_id.clone()))
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?
                .ok_or_else(|| {
                    api::error_reply(
                        DomainError::Validation(format!(
                            "posted invoice `{}` is missing",
                            receipt.invoice_id
                        ))
                        .into(),
                        &correlation_id,
                    )
                })?;
            Ok(Json(PostResponse {
                outcome: "replayed",
                invoice: Some(invoice),
                lease_expires_at: None,
            }))
        }
        BeginOutcome::InProgress { lease_expires_at } => Ok(Json(PostResponse {
            outcome: "in_flight",
            invoice: None,
            lease_expires_at: Some(lease_expires_at),
        })),
    }
}

async fn record_posted(
    invoices: &SqlInvoiceRepository,
    mut row: InvoiceStaging,
    external_invoice_id: String,
    now: DateTime<Utc>,
    correlation_id: &str,
) -> Result<Invoice, ErrorReply> {
    transition(&mut row, InvoiceStagingStatus::Posted, now)
        .map_err(|error| api::error_reply(DomainError::from(error).into(), correlation_id))?;

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
        posted_by: "api".to_string(),
        staging_snapshot: serde_json::to_value(&row).unwrap_or(serde_json::Value::Null),
    };

    invoices
        .save_staging(row)
        .await
        .map_err(|error| api::db_error(error, correlation_id))?;
    invoices
        .save_invoice(invoice.clone())
        .await
        .map_err(|error| api::db_error(error, correlation_id))?;

    Ok(invoice)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::Json;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use dealgate_core::config::AppConfig;
    use dealgate_core::domain::deal::{
        Deal, DealId, DealStage, GuardrailStatus, RiskTier,
    };
    use dealgate_core::domain::event::event_types;
    use dealgate_core::domain::invoice::{AccountingSystem, InvoiceStagingStatus};
    use dealgate_core::errors::AdapterError;
    use dealgate_core::invoice_pipeline::InMemoryAccountingAdapter;
    use dealgate_db::repositories::{
        DealRepository, InvoiceRepository, OutboxRepository, SqlDealRepository,
        SqlInvoiceRepository, SqlOutboxRepository,
    };
    use dealgate_db::{connect_with_settings, migrations, DbPool};

    use super::{
        approve_staging, post_staging, reject_staging, stage_invoice, submit_staging,
        InvoicingState, RejectRequest, StageRequest,
    };

    async fn setup() -> (DbPool, Arc<InMemoryAccountingAdapter>, InvoicingState) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        let adapter = Arc::new(InMemoryAccountingAdapter::new(AccountingSystem::QuickBooks));
        let state = InvoicingState {
            db_pool: pool.clone(),
            invoicing: AppConfig::default().invoicing,
            target: AccountingSystem::QuickBooks,
            adapter: adapter.clone(),
            lease_ttl: Duration::seconds(3600),
        };
        (pool, adapter, state)
    }

    fn won_deal(id: &str) -> Deal {
        let now = Utc::now();
        Deal {
            id: DealId(id.to_string()),
            name: "Initech platform".to_string(),
            amount: Decimal::new(10_000_000, 2),
            currency: "USD".to_string(),
            discount_percent: Decimal::ZERO,
            payment_terms_days: 30,
            risk: RiskTier::Low,
            segment: None,
            stage: DealStage::ClosedWon,
            guardrail_status: GuardrailStatus::Pass,
            guardrail_reason: None,
            guardrail_locked: false,
            operational_cost: Decimal::ZERO,
            quote_generated_at: None,
            agreement_signed_at: None,
            payment_collected_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    async fn seed_deal(pool: &DbPool, deal: Deal) {
        SqlDealRepository::new(pool.clone()).save(deal).await.expect("seed deal");
    }

    fn stage_request(deal_id: &str, trigger: &str) -> Json<StageRequest> {
        Json(StageRequest {
            deal_id: deal_id.to_string(),
            trigger_event_id: trigger.to_string(),
        })
    }

    #[tokio::test]
    async fn staging_a_won_deal_drafts_an_invoice() {
        let (pool, _adapter, state) = setup().await;
        seed_deal(&pool, won_deal("D-INV-DRAFT-1")).await;

        let response = stage_invoice(State(state), stage_request("D-INV-DRAFT-1", "evt-1"))
            .await
            .expect("stage")
            .0;

        assert_eq!(response.outcome, "drafted");
        let staging = response.staging.expect("staging body");
        assert_eq!(staging.status, InvoiceStagingStatus::Draft);
        assert_eq!(staging.subtotal, Decimal::new(10_000_000, 2));
        // 8.25% sales tax on 100,000.00
        assert_eq!(staging.tax_amount, Decimal::new(825_000, 2));
        assert_eq!(staging.total_amount, Decimal::new(10_825_000, 2));
        assert!(staging.invoice_number.starts_with("INV-"));
        assert!(staging.invoice_number.ends_with("-00001"));

        pool.close().await;
    }

    #[tokio::test]
    async fn restaging_the_same_trigger_replays_the_draft() {
        let (pool, _adapter, state) = setup().await;
        seed_deal(&pool, won_deal("D-INV-REPLAY-1")).await;

        let first = stage_invoice(State(state.clone()), stage_request("D-INV-REPLAY-1", "evt-1"))
            .await
            .expect("first")
            .0;
        let second = stage_invoice(State(state), stage_request("D-INV-REPLAY-1", "evt-1"))
            .await
            .expect("second")
            .0;

        assert_eq!(second.outcome, "replayed");
        assert_eq!(
            second.staging.expect("staging").id,
            first.staging.expect("staging").id
        );
        let stagings = SqlInvoiceRepository::new(pool.clone())
            .stagings_for_deal(&DealId("D-INV-REPLAY-1".to_string()))
            .await
            .expect("stagings");
        assert_eq!(stagings.len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn reused_trigger_with_changed_terms_is_a_conflict() {
        let (pool, _adapter, state) = setup().await;
        let mut deal = won_deal("D-INV-AMEND-1");
        seed_deal(&pool, deal.clone()).await;

        stage_invoice(State(state.clone()), stage_request("D-INV-AMEND-1", "evt-1"))
            .await
            .expect("first");

        deal.amount = Decimal::new(20_000_000, 2);
        seed_deal(&pool, deal).await;
        let error = stage_invoice(State(state), stage_request("D-INV-AMEND-1", "evt-1"))
            .await
            .expect_err("changed payload under the same trigger");
        assert_eq!(error.0, StatusCode::CONFLICT);

        pool.close().await;
    }

    #[tokio::test]
    async fn open_deals_cannot_be_staged_but_the_key_is_freed() {
        let (pool, _adapter, state) = setup().await;
        let mut deal = won_deal("D-INV-OPEN-1");
        deal.stage = DealStage::Pricing;
        seed_deal(&pool, deal.clone()).await;

        let error = stage_invoice(State(state.clone()), stage_request("D-INV-OPEN-1", "evt-1"))
            .await
            .expect_err("deal is not closed won");
        assert_eq!(error.0, StatusCode::BAD_REQUEST);

        // Once the deal closes, the released key admits the retry.
        deal.stage = DealStage::ClosedWon;
        seed_deal(&pool, deal).await;
        let response = stage_invoice(State(state), stage_request("D-INV-OPEN-1", "evt-1"))
            .await
            .expect("retry after close")
            .0;
        assert_eq!(response.outcome, "drafted");

        pool.close().await;
    }

    #[tokio::test]
    async fn full_lifecycle_posts_once_and_replays_after() {
        let (pool, adapter, state) = setup().await;
        seed_deal(&pool, won_deal("D-INV-POST-1")).await;

        let staged = stage_invoice(State(state.clone()), stage_request("D-INV-POST-1", "evt-1"))
            .await
            .expect("stage")
            .0
            .staging
            .expect("staging");
        submit_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect("submit");
        approve_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect("approve");

        let posted = post_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect("post")
            .0;
        assert_eq!(posted.outcome, "posted");
        let invoice = posted.invoice.expect("invoice body");
        assert_eq!(
            invoice.external_invoice_id,
            format!("quickbooks-{}", invoice.invoice_number)
        );

        let replayed = post_staging(Path(staged.id.0.clone()), State(state))
            .await
            .expect("replay")
            .0;
        assert_eq!(replayed.outcome, "replayed");
        assert_eq!(replayed.invoice.expect("invoice body").id, invoice.id);
        assert_eq!(adapter.posted_invoice_numbers().len(), 1);

        let stored = SqlInvoiceRepository::new(pool.clone())
            .find_staging(&staged.id)
            .await
            .expect("find")
            .expect("staging exists");
        assert_eq!(stored.status, InvoiceStagingStatus::Posted);

        let events = SqlOutboxRepository::new(pool.clone())
            .events_for_deal(&DealId("D-INV-POST-1".to_string()))
            .await
            .expect("events");
        assert!(events.iter().any(|event| event.event_type == event_types::INVOICE_POSTED));

        pool.close().await;
    }

    #[tokio::test]
    async fn failed_post_demotes_the_staging_and_admits_a_retry() {
        let (pool, adapter, state) = setup().await;
        seed_deal(&pool, won_deal("D-INV-FAIL-1")).await;

        let staged = stage_invoice(State(state.clone()), stage_request("D-INV-FAIL-1", "evt-1"))
            .await
            .expect("stage")
            .0
            .staging
            .expect("staging");
        submit_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect("submit");
        approve_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect("approve");

        adapter.push_failure(AdapterError::Fatal {
            system: "quickbooks".to_string(),
            message: "ledger is closed".to_string(),
        });
        let error = post_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect_err("adapter failure");
        assert_eq!(error.0, StatusCode::INTERNAL_SERVER_ERROR);

        let demoted = SqlInvoiceRepository::new(pool.clone())
            .find_staging(&staged.id)
            .await
            .expect("find")
            .expect("staging exists");
        assert_eq!(demoted.status, InvoiceStagingStatus::Submitted);
        assert!(demoted.validation_errors[0].contains("ledger is closed"));

        approve_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect("re-approve");
        let retried = post_staging(Path(staged.id.0.clone()), State(state))
            .await
            .expect("retry")
            .0;
        assert_eq!(retried.outcome, "posted");
        assert_eq!(adapter.posted_invoice_numbers().len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn posting_an_unapproved_staging_is_refused_then_recoverable() {
        let (pool, _adapter, state) = setup().await;
        seed_deal(&pool, won_deal("D-INV-EARLY-1")).await;

        let staged = stage_invoice(State(state.clone()), stage_request("D-INV-EARLY-1", "evt-1"))
            .await
            .expect("stage")
            .0
            .staging
            .expect("staging");

        let error = post_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect_err("draft cannot post");
        assert_eq!(error.0, StatusCode::CONFLICT);

        submit_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect("submit");
        approve_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect("approve");
        let posted = post_staging(Path(staged.id.0.clone()), State(state))
            .await
            .expect("post after approval")
            .0;
        assert_eq!(posted.outcome, "posted");

        pool.close().await;
    }

    #[tokio::test]
    async fn rejection_requires_and_records_a_reason() {
        let (pool, _adapter, state) = setup().await;
        seed_deal(&pool, won_deal("D-INV-REJECT-1")).await;

        let staged = stage_invoice(State(state.clone()), stage_request("D-INV-REJECT-1", "evt-1"))
            .await
            .expect("stage")
            .0
            .staging
            .expect("staging");
        submit_staging(Path(staged.id.0.clone()), State(state.clone()))
            .await
            .expect("submit");

        let error = reject_staging(
            Path(staged.id.0.clone()),
            State(state.clone()),
            Json(RejectRequest { reason: "  ".to_string() }),
        )
        .await
        .expect_err("blank reason");
        assert_eq!(error.0, StatusCode::BAD_REQUEST);

        let rejected = reject_staging(
            Path(staged.id.0.clone()),
            State(state),
            Json(RejectRequest { reason: "tax jurisdiction mismatch".to_string() }),
        )
        .await
        .expect("reject")
        .0;
        assert_eq!(rejected.status, InvoiceStagingStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("tax jurisdiction mismatch"));

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_staging_is_a_404() {
        let (pool, _adapter, state) = setup().await;

        let error = submit_staging(Path("S-404".to_string()), State(state))
            .await
            .expect_err("missing staging");
        assert_eq!(error.0, StatusCode::NOT_FOUND);

        pool.close().await;
    }
}
