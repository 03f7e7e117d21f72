//! Payment settlement routes.
//!
//! Every intent is written ahead of trusting any provider response, one row
//! per idempotency key. Provider callbacks are HMAC-checked when a secret is
//! configured, outcome redelivery is a no-op, and retries of a failed intent
//! open sibling attempts under derived `<parent>:attempt-<n>` sub-keys so a
//! terminal key is never recharged.

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use dealgate_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use dealgate_core::domain::deal::DealId;
use dealgate_core::domain::event::event_types;
use dealgate_core::domain::payment::{Payment, PaymentId, PaymentStatus};
use dealgate_core::errors::DomainError;
use dealgate_core::idempotency_guard::{fingerprint_payload, BeginOutcome};
use dealgate_core::settlement::{
    can_transition, verify_callback_signature, ProviderOutcome, SettlementError,
};
use dealgate_db::repositories::{
    DealRepository, PaymentRepository, SqlDealRepository, SqlIdempotencyRepository,
    SqlPaymentRepository,
};
use dealgate_db::DbPool;

use crate::api::{self, ErrorReply};

#[derive(Clone)]
pub struct PaymentsState {
    db_pool: DbPool,
    callback_secret: Option<SecretString>,
    max_retries: u32,
    lease_ttl: Duration,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub deal_id: String,
    pub idempotency_key: String,
    pub amount: Decimal,
    pub currency: String,
}

/// Provider callback payload. The signature covers the outcome fields, not
/// itself.
#[derive(Debug, Deserialize)]
pub struct CallbackRequest {
    #[serde(flatten)]
    pub outcome: ProviderOutcome,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IntentResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct IntentReceipt {
    payment_id: String,
}

pub fn router(
    db_pool: DbPool,
    callback_secret: Option<SecretString>,
    max_retries: u32,
    lease_ttl: Duration,
) -> Router {
    Router::new()
        .route("/api/payments", post(create_intent))
        .route("/api/payments/{payment_id}/outcome", post(record_outcome))
        .route("/api/payments/{payment_id}/rollback", post(rollback_payment))
        .route("/api/payments/{payment_id}/retry", post(retry_intent))
        .with_state(PaymentsState { db_pool, callback_secret, max_retries, lease_ttl })
}

async fn load_payment(
    payments: &SqlPaymentRepository,
    payment_id: &str,
    correlation_id: &str,
) -> Result<Payment, ErrorReply> {
    payments
        .find_by_id(&PaymentId(payment_id.to_string()))
        .await
        .map_err(|error| api::db_error(error, correlation_id))?
        .ok_or_else(|| api::not_found("payment", payment_id, correlation_id))
}

async fn resolve_receipt(
    payments: &SqlPaymentRepository,
    result: &str,
    correlation_id: &str,
) -> Result<Payment, ErrorReply> {
    let receipt: IntentReceipt = serde_json::from_str(result).map_err(|_| {
        api::error_reply(
            DomainError::Validation("stored settlement receipt is unreadable".to_owned()).into(),
            correlation_id,
        )
    })?;
    payments
        .find_by_id(&PaymentId(receipt.payment_id.clone()))
        .await
        .map_err(|error| api::db_error(error, correlation_id))?
        .ok_or_else(|| {
            api::error_reply(
                DomainError::Validation(format!("payment `{}` is missing", receipt.payment_id))
                    .into(),
                correlation_id,
            )
        })
}

async fn create_intent(
    State(state): State<PaymentsState>,
    Json(request): Json<CreateRequest>,
) -> Result<Json<IntentResponse>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    if request.idempotency_key.trim().is_empty() {
        return Err(api::bad_request("idempotency_key is required", &correlation_id));
    }
    if request.currency.trim().is_empty() {
        return Err(api::bad_request("currency is required", &correlation_id));
    }
    if request.amount <= Decimal::ZERO {
        return Err(api::bad_request("amount must be positive", &correlation_id));
    }

    let deal = SqlDealRepository::new(state.db_pool.clone())
        .find_by_id(&DealId(request.deal_id.clone()))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .ok_or_else(|| api::not_found("deal", &request.deal_id, &correlation_id))?;

    let payments = SqlPaymentRepository::new(state.db_pool.clone());
    let guard = SqlIdempotencyRepository::new(state.db_pool.clone(), state.lease_ttl);

    let key = request.idempotency_key.trim().to_string();
    let fingerprint = fingerprint_payload(&serde_json::json!({
        "deal_id": deal.id.0,
        "idempotency_key": key,
        "amount": request.amount.to_string(),
        "currency": request.currency,
    }));

    match guard
        .begin(&key, &fingerprint, &correlation_id, now)
        .await
        .map_err(|error| api::guard_error(error, &correlation_id))?
    {
        BeginOutcome::Proceed { .. } => {
            let payment = Payment {
                id: PaymentId(Uuid::new_v4().to_string()),
                deal_id: deal.id.clone(),
                idempotency_key: key.clone(),
                parent_key: key.clone(),
                attempt_number: 1,
                status: PaymentStatus::Pending,
                amount: request.amount,
                currency: request.currency.clone(),
                provider_reference: None,
                failure_reason: None,
                error_code: None,
                completed_at: None,
                rolled_back_at: None,
                auto_recovered: false,
                created_at: now,
                updated_at: now,
            };
            payments
                .save(payment.clone())
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?;
            let receipt = serde_json::json!({ "payment_id": payment.id.0 }).to_string();
            guard
                .complete(&key, &receipt, now)
                .await
                .map_err(|error| api::guard_error(error, &correlation_id))?;

            api::record_audit(
                &state.db_pool,
                AuditEvent::new(
                    Some(deal.id.clone()),
                    &correlation_id,
                    "payment.created",
                    AuditCategory::Payment,
                    "settlement",
                    AuditOutcome::Success,
                )
                .with_metadata("idempotency_key", key.clone()),
            )
            .await;

            info!(
                event_name = "api.payments.created",
                correlation_id = %correlation_id,
                deal_id = %deal.id,
                payment_id = %payment.id,
                amount = %payment.amount,
                currency = %payment.currency,
                "settlement intent created"
            );

            Ok(Json(IntentResponse {
                outcome: "created",
                payment: Some(payment),
                lease_expires_at: None,
            }))
        }
        BeginOutcome::Cached { result } => {
            let payment = resolve_receipt(&payments, &result, &correlation_id).await?;
            Ok(Json(IntentResponse {
                outcome: "replayed",
                payment: Some(payment),
                lease_expires_at: None,
            }))
        }
        BeginOutcome::InProgress { lease_expires_at } => {
            match payments
                .find_by_key(&key)
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?
            {
                Some(payment) => Ok(Json(IntentResponse {
                    outcome: "replayed",
                    payment: Some(payment),
                    lease_expires_at: None,
                })),
                None => Ok(Json(IntentResponse {
                    outcome: "in_flight",
                    payment: None,
                    lease_expires_at: Some(lease_expires_at),
                })),
            }
        }
    }
}

async fn record_outcome(
    Path(payment_id): Path<String>,
    State(state): State<PaymentsState>,
    Json(request): Json<CallbackRequest>,
) -> Result<Json<Payment>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let payments = SqlPaymentRepository::new(state.db_pool.clone());
    let mut payment = load_payment(&payments, &payment_id, &correlation_id).await?;

    if let Some(secret) = &state.callback_secret {
        let signed_body = serde_json::to_vec(&request.outcome).unwrap_or_default();
        let verified = request.signature.as_deref().is_some_and(|signature| {
            verify_callback_signature(secret.expose_secret(), &signed_body, signature)
        });
        if !verified {
            api::record_audit(
                &state.db_pool,
                AuditEvent::new(
                    Some(payment.deal_id.clone()),
                    &correlation_id,
                    "payment.callback_rejected",
                    AuditCategory::Payment,
                    "settlement",
                    AuditOutcome::Rejected,
                ),
            )
            .await;
            return Err(api::error_reply(
                DomainError::from(SettlementError::SignatureRejected).into(),
                &correlation_id,
            ));
        }
    }

    let target = match &request.outcome {
        ProviderOutcome::Succeeded { .. } => PaymentStatus::Succeeded,
        ProviderOutcome::Failed { .. } => PaymentStatus::Failed,
    };
    if payment.status == target {
        // Redelivered callback; the attempt already carries this outcome.
        return Ok(Json(payment));
    }
    if !can_transition(payment.status, target) {
        return Err(api::error_reply(
            DomainError::from(SettlementError::InvalidTransition {
                from: payment.status,
                to: target,
            })
            .into(),
            &correlation_id,
        ));
    }

    let siblings = payments
        .attempts_for(&payment.parent_key)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;
    let recovered = target == PaymentStatus::Succeeded
        && siblings.iter().any(|attempt| {
            attempt.id != payment.id && attempt.status == PaymentStatus::Failed
        });

    match &request.outcome {
        ProviderOutcome::Succeeded { provider_reference } => {
            payment.status = PaymentStatus::Succeeded;
            payment.provider_reference = provider_reference.clone();
            payment.completed_at = Some(now);
            payment.auto_recovered = recovered;
        }
        ProviderOutcome::Failed { failure_reason, error_code } => {
            payment.status = PaymentStatus::Failed;
            payment.failure_reason = Some(failure_reason.clone());
            payment.error_code = error_code.clone();
        }
    }
    payment.updated_at = now;
    payments
        .save(payment.clone())
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    let (event_type, audit_type, audit_outcome) = match payment.status {
        PaymentStatus::Succeeded => {
            (event_types::PAYMENT_SUCCEEDED, "payment.succeeded", AuditOutcome::Success)
        }
        _ => (event_types::PAYMENT_FAILED, "payment.failed", AuditOutcome::Failed),
    };
    api::enqueue_event(
        &state.db_pool,
        Some(payment.deal_id.clone()),
        event_type,
        serde_json::json!({
            "payment_id": payment.id.0,
            "deal_id": payment.deal_id.0,
            "parent_key": payment.parent_key,
            "amount": payment.amount,
            "currency": payment.currency,
            "provider_reference": payment.provider_reference,
            "failure_reason": payment.failure_reason,
            "auto_recovered": payment.auto_recovered,
        }),
        now,
    )
    .await;
    api::record_audit(
        &state.db_pool,
        AuditEvent::new(
            Some(payment.deal_id.clone()),
            &correlation_id,
            audit_type,
            AuditCategory::Payment,
            "settlement",
            audit_outcome,
        )
        .with_metadata("status", payment.status.as_str()),
    )
    .await;

    info!(
        event_name = "api.payments.settled",
        correlation_id = %correlation_id,
        deal_id = %payment.deal_id,
        payment_id = %payment.id,
        status = payment.status.as_str(),
        auto_recovered = payment.auto_recovered,
        "provider outcome recorded"
    );

    Ok(Json(payment))
}

async fn rollback_payment(
    Path(payment_id): Path<String>,
    State(state): State<PaymentsState>,
) -> Result<Json<Payment>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let payments = SqlPaymentRepository::new(state.db_pool.clone());
    let mut payment = load_payment(&payments, &payment_id, &correlation_id).await?;

    if payment.status == PaymentStatus::RolledBack {
        return Ok(Json(payment));
    }
    if !can_transition(payment.status, PaymentStatus::RolledBack) {
        return Err(api::error_reply(
            DomainError::from(SettlementError::InvalidTransition {
                from: payment.status,
                to: PaymentStatus::RolledBack,
            })
            .into(),
            &correlation_id,
        ));
    }

    payment.status = PaymentStatus::RolledBack;
    payment.rolled_back_at = Some(now);
    payment.updated_at = now;
    payments
        .save(payment.clone())
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    api::enqueue_event(
        &state.db_pool,
        Some(payment.deal_id.clone()),
        event_types::PAYMENT_ROLLED_BACK,
        serde_json::json!({
            "payment_id": payment.id.0,
            "deal_id": payment.deal_id.0,
            "parent_key": payment.parent_key,
            "amount": payment.amount,
            "currency": payment.currency,
        }),
        now,
    )
    .await;
    api::record_audit(
        &state.db_pool,
        AuditEvent::new(
            Some(payment.deal_id.clone()),
            &correlation_id,
            "payment.rolled_back",
            AuditCategory::Payment,
            "settlement",
            AuditOutcome::Success,
        ),
    )
    .await;

    info!(
        event_name = "api.payments.rolled_back",
        correlation_id = %correlation_id,
        deal_id = %payment.deal_id,
        payment_id = %payment.id,
        "payment rolled back"
    );

    Ok(Json(payment))
}

async fn retry_intent(
    Path(payment_id): Path<String>,
    State(state): State<PaymentsState>,
) -> Result<Json<IntentResponse>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let payments = SqlPaymentRepository::new(state.db_pool.clone());
    let guard = SqlIdempotencyRepository::new(state.db_pool.clone(), state.lease_ttl);

    let origin = load_payment(&payments, &payment_id, &correlation_id).await?;
    let attempts = payments
        .attempts_for(&origin.parent_key)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;
    let latest = attempts.last().ok_or_else(|| {
        api::error_reply(
            DomainError::from(SettlementError::UnknownIntent {
                key: origin.parent_key.clone(),
            })
            .into(),
            &correlation_id,
        )
    })?;

    if latest.status != PaymentStatus::Failed {
        return Err(api::error_reply(
            DomainError::from(SettlementError::InvalidTransition {
                from: latest.status,
                to: PaymentStatus::Pending,
            })
            .into(),
            &correlation_id,
        ));
    }
    if latest.attempt_number > state.max_retries {
        return Err(api::error_reply(
            DomainError::Validation(format!(
                "settlement intent `{}` exhausted its {} retries",
                origin.parent_key, state.max_retries
            ))
            .into(),
            &correlation_id,
        ));
    }

    let next_attempt = latest.attempt_number + 1;
    let sub_key = format!("{}:attempt-{}", origin.parent_key, next_attempt);
    let fingerprint = fingerprint_payload(&serde_json::json!({
        "parent_key": origin.parent_key,
        "attempt_number": next_attempt,
        "amount": latest.amount.to_string(),
        "currency": latest.currency,
    }));

    match guard
        .begin(&sub_key, &fingerprint, &correlation_id, now)
        .await
        .map_err(|error| api::guard_error(error, &correlation_id))?
    {
        BeginOutcome::Proceed { .. } => {
            let payment = Payment {
                id: PaymentId(Uuid::new_v4().to_string()),
                deal_id: latest.deal_id.clone(),
                idempotency_key: sub_key.clone(),
                parent_key: origin.parent_key.clone(),
                attempt_number: next_attempt,
                status: PaymentStatus::Pending,
                amount: latest.amount,
                currency: latest.currency.clone(),
                provider_reference: None,
                failure_reason: None,
                error_code: None,
                completed_at: None,
                rolled_back_at: None,
                auto_recovered: false,
                created_at: now,
                updated_at: now,
            };
            payments
                .save(payment.clone())
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?;
            let receipt = serde_json::json!({ "payment_id": payment.id.0 }).to_string();
            guard
                .complete(&sub_key, &receipt, now)
                .await
                .map_err(|error| api::guard_error(error, &correlation_id))?;

            api::record_audit(
                &state.db_pool,
                AuditEvent::new(
                    Some(payment.deal_id.clone()),
                    &correlation_id,
                    "payment.retried",
                    AuditCategory::Payment,
                    "settlement",
                    AuditOutcome::Success,
                )
                .with_metadata("attempt", next_attempt.to_string()),
            )
            .await;

            info!(
                event_name = "api.payments.retried",
                correlation_id = %correlation_id,
                deal_id = %payment.deal_id,
                payment_id = %payment.id,
                attempt = payment.attempt_number,
                "settlement retry opened"
            );

            Ok(Json(IntentResponse {
                outcome: "created",
                payment: Some(payment),
                lease_expires_at: None,
            }))
        }
        BeginOutcome::Cached { result } => {
            let payment = resolve_receipt(&payments, &result, &correlation_id).await?;
            Ok(Json(IntentResponse {
                outcome: "replayed",
                payment: Some(payment),
                lease_expires_at: None,
            }))
        }
        BeginOutcome::InProgress { lease_expires_at } => {
            match payments
                .find_by_key(&sub_key)
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?
            {
                Some(payment) => Ok(Json(IntentResponse {
                    outcome: "replayed",
                    payment: Some(payment),
                    lease_expires_at: None,
                })),
                None => Ok(Json(IntentResponse {
                    outcome: "in_flight",
                    payment: None,
                    lease_expires_at: Some(lease_expires_at),
                })),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::Json;
    use chrono::{Duration, Utc};
    use hmac::{Hmac, Mac};
    use rust_decimal::Decimal;
    use sha2::Sha256;

    use dealgate_core::domain::deal::{
        Deal, DealId, DealStage, GuardrailStatus, RiskTier,
    };
    use dealgate_core::domain::event::event_types;
    use dealgate_core::domain::payment::{Payment, PaymentStatus};
    use dealgate_core::settlement::ProviderOutcome;
    use dealgate_db::repositories::{
        DealRepository, OutboxRepository, PaymentRepository, SqlDealRepository,
        SqlOutboxRepository, SqlPaymentRepository,
    };
    use dealgate_db::{connect_with_settings, migrations, DbPool};

    use super::{
        create_intent, record_outcome, retry_intent, rollback_payment, CallbackRequest,
        CreateRequest, PaymentsState,
    };

    async fn setup() -> (DbPool, PaymentsState) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        let state = PaymentsState {
            db_pool: pool.clone(),
            callback_secret: None,
            max_retries: 3,
            lease_ttl: Duration::seconds(3600),
        };
        (pool, state)
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

    fn create_request(deal_id: &str, key: &str, amount: Decimal) -> Json<CreateRequest> {
        Json(CreateRequest {
            deal_id: deal_id.to_string(),
            idempotency_key: key.to_string(),
            amount,
            currency: "USD".to_string(),
        })
    }

    fn succeeded() -> CallbackRequest {
        CallbackRequest {
            outcome: ProviderOutcome::Succeeded {
                provider_reference: Some("ch_0042".to_string()),
            },
            signature: None,
        }
    }

    fn failed() -> CallbackRequest {
        CallbackRequest {
            outcome: ProviderOutcome::Failed {
                failure_reason: "card_declined".to_string(),
                error_code: Some("DECLINED".to_string()),
            },
            signature: None,
        }
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac key");
        mac.update(body);
        mac.finalize().into_bytes().iter().map(|byte| format!("{byte:02x}")).collect()
    }

    async fn seed_intent(pool: &DbPool, state: &PaymentsState, deal_id: &str, key: &str) -> Payment {
        SqlDealRepository::new(pool.clone()).save(won_deal(deal_id)).await.expect("seed deal");
        create_intent(State(state.clone()), create_request(deal_id, key, Decimal::new(500_000, 2)))
            .await
            .expect("create intent")
            .0
            .payment
            .expect("payment body")
    }

    #[tokio::test]
    async fn creating_an_intent_writes_one_pending_row() {
        let (pool, state) = setup().await;
        let payment = seed_intent(&pool, &state, "D-PAY-CREATE-1", "pay-create-100").await;

        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.attempt_number, 1);
        assert_eq!(payment.parent_key, "pay-create-100");

        let replay = create_intent(
            State(state),
            create_request("D-PAY-CREATE-1", "pay-create-100", Decimal::new(500_000, 2)),
        )
        .await
        .expect("replay")
        .0;
        assert_eq!(replay.outcome, "replayed");
        assert_eq!(replay.payment.expect("payment body").id, payment.id);

        let attempts = SqlPaymentRepository::new(pool.clone())
            .attempts_for("pay-create-100")
            .await
            .expect("attempts");
        assert_eq!(attempts.len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn same_key_with_a_different_amount_is_a_conflict() {
        let (pool, state) = setup().await;
        seed_intent(&pool, &state, "D-PAY-AMEND-1", "pay-amend-100").await;

        let error = create_intent(
            State(state),
            create_request("D-PAY-AMEND-1", "pay-amend-100", Decimal::new(750_000, 2)),
        )
        .await
        .expect_err("amount changed under the same key");
        assert_eq!(error.0, StatusCode::CONFLICT);

        pool.close().await;
    }

    #[tokio::test]
    async fn blank_keys_and_non_positive_amounts_are_refused() {
        let (pool, state) = setup().await;

        let blank_key = create_intent(
            State(state.clone()),
            create_request("D-PAY-BAD-1", "  ", Decimal::new(500_000, 2)),
        )
        .await
        .expect_err("blank key");
        assert_eq!(blank_key.0, StatusCode::BAD_REQUEST);

        let zero_amount =
            create_intent(State(state), create_request("D-PAY-BAD-1", "pay-bad-100", Decimal::ZERO))
                .await
                .expect_err("zero amount");
        assert_eq!(zero_amount.0, StatusCode::BAD_REQUEST);

        pool.close().await;
    }

    #[tokio::test]
    async fn provider_success_settles_idempotently_and_emits_once() {
        let (pool, state) = setup().await;
        let payment = seed_intent(&pool, &state, "D-PAY-SETTLE-1", "pay-settle-100").await;

        let settled = record_outcome(
            Path(payment.id.0.clone()),
            State(state.clone()),
            Json(succeeded()),
        )
        .await
        .expect("settle")
        .0;
        assert_eq!(settled.status, PaymentStatus::Succeeded);
        assert_eq!(settled.provider_reference.as_deref(), Some("ch_0042"));
        assert!(settled.completed_at.is_some());
        assert!(!settled.auto_recovered);

        let redelivered = record_outcome(
            Path(payment.id.0.clone()),
            State(state.clone()),
            Json(succeeded()),
        )
        .await
        .expect("redeliver")
        .0;
        assert_eq!(redelivered.updated_at, settled.updated_at);

        let events = SqlOutboxRepository::new(pool.clone())
            .events_for_deal(&DealId("D-PAY-SETTLE-1".to_string()))
            .await
            .expect("events");
        let succeeded_events = events
            .iter()
            .filter(|event| event.event_type == event_types::PAYMENT_SUCCEEDED)
            .count();
        assert_eq!(succeeded_events, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn settled_attempts_refuse_contradicting_outcomes() {
        let (pool, state) = setup().await;
        let payment = seed_intent(&pool, &state, "D-PAY-FINAL-1", "pay-final-100").await;

        record_outcome(Path(payment.id.0.clone()), State(state.clone()), Json(failed()))
            .await
            .expect("fail");

        let error =
            record_outcome(Path(payment.id.0.clone()), State(state), Json(succeeded()))
                .await
                .expect_err("failed attempt cannot succeed");
        assert_eq!(error.0, StatusCode::CONFLICT);

        pool.close().await;
    }

    #[tokio::test]
    async fn signed_callbacks_are_enforced_when_a_secret_is_set() {
        let (pool, mut state) = setup().await;
        state.callback_secret = Some("whsec_test".to_string().into());
        let payment = seed_intent(&pool, &state, "D-PAY-SIGNED-1", "pay-signed-100").await;

        let unsigned =
            record_outcome(Path(payment.id.0.clone()), State(state.clone()), Json(succeeded()))
                .await
                .expect_err("unsigned callback");
        assert_eq!(unsigned.0, StatusCode::BAD_REQUEST);

        let mut tampered = succeeded();
        tampered.signature = Some("deadbeef".to_string());
        let rejected =
            record_outcome(Path(payment.id.0.clone()), State(state.clone()), Json(tampered))
                .await
                .expect_err("tampered signature");
        assert_eq!(rejected.0, StatusCode::BAD_REQUEST);

        let mut signed = succeeded();
        let body = serde_json::to_vec(&signed.outcome).expect("serialize outcome");
        signed.signature = Some(sign("whsec_test", &body));
        let settled = record_outcome(Path(payment.id.0.clone()), State(state), Json(signed))
            .await
            .expect("signed callback")
            .0;
        assert_eq!(settled.status, PaymentStatus::Succeeded);

        pool.close().await;
    }

    #[tokio::test]
    async fn retry_opens_a_sibling_attempt_under_a_derived_sub_key() {
        let (pool, state) = setup().await;
        let first = seed_intent(&pool, &state, "D-PAY-RETRY-1", "pay-retry-100").await;
        record_outcome(Path(first.id.0.clone()), State(state.clone()), Json(failed()))
            .await
            .expect("fail first");

        let retried = retry_intent(Path(first.id.0.clone()), State(state.clone()))
            .await
            .expect("retry")
            .0;
        assert_eq!(retried.outcome, "created");
        let second = retried.payment.expect("payment body");
        assert_eq!(second.idempotency_key, "pay-retry-100:attempt-2");
        assert_eq!(second.parent_key, "pay-retry-100");
        assert_eq!(second.attempt_number, 2);
        assert_eq!(second.amount, first.amount);

        // The new attempt is pending, so another retry is refused.
        let error = retry_intent(Path(first.id.0.clone()), State(state))
            .await
            .expect_err("latest attempt is pending");
        assert_eq!(error.0, StatusCode::CONFLICT);

        let stored = SqlPaymentRepository::new(pool.clone())
            .find_by_id(&first.id)
            .await
            .expect("find")
            .expect("payment exists");
        assert_eq!(stored.status, PaymentStatus::Failed);

        pool.close().await;
    }

    #[tokio::test]
    async fn recovery_after_a_failed_attempt_is_flagged() {
        let (pool, state) = setup().await;
        let first = seed_intent(&pool, &state, "D-PAY-RECOVER-1", "pay-recover-100").await;
        record_outcome(Path(first.id.0.clone()), State(state.clone()), Json(failed()))
            .await
            .expect("fail first");

        let second = retry_intent(Path(first.id.0.clone()), State(state.clone()))
            .await
            .expect("retry")
            .0
            .payment
            .expect("payment body");
        let settled =
            record_outcome(Path(second.id.0.clone()), State(state), Json(succeeded()))
                .await
                .expect("settle retry")
                .0;

        assert_eq!(settled.status, PaymentStatus::Succeeded);
        assert!(settled.auto_recovered);

        pool.close().await;
    }

    #[tokio::test]
    async fn retries_stop_at_the_configured_limit() {
        let (pool, mut state) = setup().await;
        state.max_retries = 1;
        let first = seed_intent(&pool, &state, "D-PAY-CAP-1", "pay-cap-100").await;
        record_outcome(Path(first.id.0.clone()), State(state.clone()), Json(failed()))
            .await
            .expect("fail first");

        let second = retry_intent(Path(first.id.0.clone()), State(state.clone()))
            .await
            .expect("first retry")
            .0
            .payment
            .expect("payment body");
        record_outcome(Path(second.id.0.clone()), State(state.clone()), Json(failed()))
            .await
            .expect("fail second");

        let error = retry_intent(Path(first.id.0.clone()), State(state))
            .await
            .expect_err("limit reached");
        assert_eq!(error.0, StatusCode::BAD_REQUEST);

        pool.close().await;
    }

    #[tokio::test]
    async fn rollback_reverses_succeeded_payments_only() {
        let (pool, state) = setup().await;
        let payment = seed_intent(&pool, &state, "D-PAY-RB-1", "pay-rb-100").await;

        let while_pending = rollback_payment(Path(payment.id.0.clone()), State(state.clone()))
            .await
            .expect_err("pending cannot roll back");
        assert_eq!(while_pending.0, StatusCode::CONFLICT);

        record_outcome(Path(payment.id.0.clone()), State(state.clone()), Json(succeeded()))
            .await
            .expect("settle");
        let rolled_back = rollback_payment(Path(payment.id.0.clone()), State(state.clone()))
            .await
            .expect("rollback")
            .0;
        assert_eq!(rolled_back.status, PaymentStatus::RolledBack);
        assert!(rolled_back.rolled_back_at.is_some());

        let repeated = rollback_payment(Path(payment.id.0.clone()), State(state))
            .await
            .expect("repeat")
            .0;
        assert_eq!(repeated.rolled_back_at, rolled_back.rolled_back_at);

        let events = SqlOutboxRepository::new(pool.clone())
            .events_for_deal(&DealId("D-PAY-RB-1".to_string()))
            .await
            .expect("events");
        let rollbacks = events
            .iter()
            .filter(|event| event.event_type == event_types::PAYMENT_ROLLED_BACK)
            .count();
        assert_eq!(rollbacks, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_payment_is_a_404() {
        let (pool, state) = setup().await;

        let error = record_outcome(Path("P-404".to_string()), State(state), Json(succeeded()))
            .await
            .expect_err("missing payment");
        assert_eq!(error.0, StatusCode::NOT_FOUND);

        pool.close().await;
    }
}
