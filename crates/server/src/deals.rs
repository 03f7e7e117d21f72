//! Guardrail evaluation and deal stage routes.
//!
//! Endpoints:
//! - `POST /api/guardrails/evaluate`      — evaluate ad-hoc terms, stateless
//! - `POST /api/deals/{deal_id}/evaluate` — evaluate a deal, persist the
//!   verdict and route an approval chain on violation
//! - `POST /api/deals/{deal_id}/stage`    — advance the deal stage machine

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use dealgate_core::approval_router::ApprovalRouter;
use dealgate_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use dealgate_core::config::GuardrailConfig;
use dealgate_core::domain::approval::Approval;
use dealgate_core::domain::deal::{Deal, DealStage};
use dealgate_core::domain::event::event_types;
use dealgate_core::domain::policy::Policy;
use dealgate_core::errors::DomainError;
use dealgate_core::guardrails::{
    apply_verdict, GuardrailEvaluator, GuardrailVerdict, PolicySnapshot,
};
use dealgate_db::repositories::{
    ApprovalRepository, DealRepository, PolicyRepository, SqlApprovalRepository,
    SqlDealRepository, SqlPolicyRepository,
};
use dealgate_db::DbPool;

use crate::api::{self, ErrorReply};

#[derive(Clone)]
pub struct DealsState {
    db_pool: DbPool,
    limits: GuardrailConfig,
}

#[derive(Debug, Deserialize)]
pub struct StageRequest {
    pub stage: DealStage,
}

#[derive(Debug, Serialize)]
pub struct EvaluateDealResponse {
    pub deal: Deal,
    pub verdict: GuardrailVerdict,
    pub chain: Vec<Approval>,
}

pub fn router(db_pool: DbPool, limits: GuardrailConfig) -> Router {
    Router::new()
        .route("/api/guardrails/evaluate", post(evaluate_terms))
        .route("/api/deals/{deal_id}/evaluate", post(evaluate_deal))
        .route("/api/deals/{deal_id}/stage", post(stage_deal))
        .with_state(DealsState { db_pool, limits })
}

/// Active policies as the evaluator sees them right now. Status alone is not
/// enough; effective and expiry windows are checked against the clock.
async fn policy_snapshot(
    pool: &DbPool,
    now: chrono::DateTime<Utc>,
    correlation_id: &str,
) -> Result<PolicySnapshot, ErrorReply> {
    let policies: Vec<Policy> = SqlPolicyRepository::new(pool.clone())
        .active_policies()
        .await
        .map_err(|error| api::db_error(error, correlation_id))?
        .into_iter()
        .filter(|policy| policy.is_active_at(now))
        .collect();
    Ok(PolicySnapshot::new(policies, now))
}

async fn evaluate_terms(
    State(state): State<DealsState>,
    Json(terms): Json<dealgate_core::domain::deal::DealTerms>,
) -> Result<Json<GuardrailVerdict>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    terms
        .validate()
        .map_err(|error| api::error_reply(error.into(), &correlation_id))?;

    let snapshot = policy_snapshot(&state.db_pool, now, &correlation_id).await?;
    let verdict = GuardrailEvaluator::new(state.limits.clone()).evaluate(&terms, &snapshot, now);

    info!(
        event_name = "api.guardrails.evaluated",
        correlation_id = %correlation_id,
        status = verdict.status.as_str(),
        violations = verdict.violations.len(),
        "ad-hoc guardrail evaluation"
    );

    Ok(Json(verdict))
}

async fn evaluate_deal(
    Path(deal_id): Path<String>,
    State(state): State<DealsState>,
) -> Result<Json<EvaluateDealResponse>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let deals = SqlDealRepository::new(state.db_pool.clone());
    let approvals = SqlApprovalRepository::new(state.db_pool.clone());

    let mut deal = deals
        .find_by_id(&dealgate_core::domain::deal::DealId(deal_id.clone()))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .ok_or_else(|| api::not_found("deal", &deal_id, &correlation_id))?;

    let snapshot = policy_snapshot(&state.db_pool, now, &correlation_id).await?;
    let verdict =
        GuardrailEvaluator::new(state.limits.clone()).evaluate(&deal.pricing_terms(), &snapshot, now);

    // A locked deal keeps its approved verdict; the evaluation is reported
    // but neither the deal nor its chain moves.
    if !deal.guardrail_locked {
        apply_verdict(&mut deal, &verdict);
        deal.updated_at = now;

        if verdict.is_pass() {
            api::record_audit(
                &state.db_pool,
                AuditEvent::new(
                    Some(deal.id.clone()),
                    &correlation_id,
                    "guardrail.pass",
                    AuditCategory::Guardrail,
                    "guardrail-evaluator",
                    AuditOutcome::Success,
                ),
            )
            .await;
        } else {
            let mut prior = approvals
                .chain_for_deal(&deal.id)
                .await
                .map_err(|error| api::db_error(error, &correlation_id))?;
            let new_steps = ApprovalRouter::new(state.limits.clone())
                .route(&deal, &verdict, &mut prior, now)
                .map_err(|error| {
                    api::error_reply(DomainError::from(error).into(), &correlation_id)
                })?;

            for approval in prior.iter().chain(new_steps.iter()) {
                approvals
                    .save(approval.clone())
                    .await
                    .map_err(|error| api::db_error(error, &correlation_id))?;
            }

            api::enqueue_event(
                &state.db_pool,
                Some(deal.id.clone()),
                event_types::GUARDRAIL_VIOLATION,
                serde_json::json!({
                    "deal_id": deal.id.0,
                    "reason": verdict.reason(),
                    "violations": verdict.violations,
                    "required_steps": verdict.required_steps,
                }),
                now,
            )
            .await;

            let checks: Vec<&str> =
                verdict.violations.iter().map(|violation| violation.check.as_str()).collect();
            api::record_audit(
                &state.db_pool,
                AuditEvent::new(
                    Some(deal.id.clone()),
                    &correlation_id,
                    "guardrail.violation",
                    AuditCategory::Guardrail,
                    "guardrail-evaluator",
                    AuditOutcome::Rejected,
                )
                .with_metadata("checks", checks.join(",")),
            )
            .await;
        }

        deals
            .save(deal.clone())
            .await
            .map_err(|error| api::db_error(error, &correlation_id))?;
    }

    let chain = approvals
        .chain_for_deal(&deal.id)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    info!(
        event_name = "api.deals.evaluated",
        correlation_id = %correlation_id,
        deal_id = %deal.id,
        status = verdict.status.as_str(),
        locked = deal.guardrail_locked,
        chain_len = chain.len(),
        "deal guardrail evaluation"
    );

    Ok(Json(EvaluateDealResponse { deal, verdict, chain }))
}

async fn stage_deal(
    Path(deal_id): Path<String>,
    State(state): State<DealsState>,
    Json(body): Json<StageRequest>,
) -> Result<Json<Deal>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let deals = SqlDealRepository::new(state.db_pool.clone());
    let mut deal = deals
        .find_by_id(&dealgate_core::domain::deal::DealId(deal_id.clone()))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .ok_or_else(|| api::not_found("deal", &deal_id, &correlation_id))?;

    let previous = deal.stage;
    deal.transition_to(body.stage, now)
        .map_err(|error| api::error_reply(DomainError::from(error).into(), &correlation_id))?;

    if previous != DealStage::ClosedWon && deal.stage == DealStage::ClosedWon {
        api::enqueue_event(
            &state.db_pool,
            Some(deal.id.clone()),
            event_types::DEAL_CLOSED_WON,
            serde_json::json!({
                "deal_id": deal.id.0,
                "amount": deal.amount,
                "currency": deal.currency,
            }),
            now,
        )
        .await;
    }

    api::record_audit(
        &state.db_pool,
        AuditEvent::new(
            Some(deal.id.clone()),
            &correlation_id,
            "deal.stage_changed",
            AuditCategory::StateTransition,
            "deal-pipeline",
            AuditOutcome::Success,
        )
        .with_metadata("from", previous.as_str())
        .with_metadata("to", deal.stage.as_str()),
    )
    .await;

    deals
        .save(deal.clone())
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    info!(
        event_name = "api.deals.stage_changed",
        correlation_id = %correlation_id,
        deal_id = %deal.id,
        from = previous.as_str(),
        to = deal.stage.as_str(),
        "deal stage transition"
    );

    Ok(Json(deal))
}

#[cfg(test)]
mod tests {
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::Json;
    use chrono::Utc;
    use rust_decimal::Decimal;

    use dealgate_core::config::AppConfig;
    use dealgate_core::domain::approval::{ApprovalStatus, ApprovalStep};
    use dealgate_core::domain::deal::{
        Deal, DealId, DealStage, DealTerms, GuardrailStatus, RiskTier,
    };
    use dealgate_core::domain::event::event_types;
    use dealgate_db::repositories::{
        ApprovalRepository, DealRepository, OutboxRepository, SqlApprovalRepository,
        SqlDealRepository, SqlOutboxRepository,
    };
    use dealgate_db::{connect_with_settings, migrations, DbPool};

    use super::{evaluate_deal, evaluate_terms, stage_deal, DealsState, StageRequest};

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn state(pool: &DbPool) -> DealsState {
        DealsState { db_pool: pool.clone(), limits: AppConfig::default().guardrails }
    }

    fn deal_fixture(id: &str, risk: RiskTier, discount: Decimal, stage: DealStage) -> Deal {
        let now = Utc::now();
        Deal {
            id: DealId(id.to_string()),
            name: "Initech platform".to_string(),
            amount: Decimal::new(25_000_000, 2),
            currency: "USD".to_string(),
            discount_percent: discount,
            payment_terms_days: 30,
            risk,
            segment: None,
            stage,
            guardrail_status: GuardrailStatus::Pass,
            guardrail_reason: None,
            guardrail_locked: false,
            operational_cost: Decimal::ZERO,
            quote_generated_at: None,
            agreement_signed_at: None,
            payment_collected_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn terms(risk: RiskTier, discount: Decimal) -> DealTerms {
        DealTerms {
            amount: Decimal::new(25_000_000, 2),
            currency: "USD".to_string(),
            discount_percent: discount,
            payment_terms_days: 30,
            risk,
            segment: None,
        }
    }

    #[tokio::test]
    async fn ad_hoc_evaluation_flags_a_discount_breach() {
        let pool = setup().await;

        let verdict = evaluate_terms(
            State(state(&pool)),
            Json(terms(RiskTier::Medium, Decimal::new(250, 1))),
        )
        .await
        .expect("evaluate")
        .0;

        assert!(!verdict.is_pass());
        assert_eq!(verdict.required_steps, vec![ApprovalStep::FinanceReview]);
        assert!(verdict.reason().unwrap().contains("25.0% exceeds 20.0% limit"));

        pool.close().await;
    }

    #[tokio::test]
    async fn ad_hoc_evaluation_rejects_invalid_terms() {
        let pool = setup().await;

        let error = evaluate_terms(
            State(state(&pool)),
            Json(terms(RiskTier::Low, Decimal::from(120))),
        )
        .await
        .expect_err("out-of-range discount");
        assert_eq!(error.0, StatusCode::BAD_REQUEST);

        pool.close().await;
    }

    #[tokio::test]
    async fn violated_deal_gets_a_persisted_verdict_and_chain() {
        let pool = setup().await;
        let deals = SqlDealRepository::new(pool.clone());
        deals
            .save(deal_fixture(
                "D-EVAL-VIOL-1",
                RiskTier::High,
                Decimal::new(150, 1),
                DealStage::Pricing,
            ))
            .await
            .expect("seed deal");

        let response = evaluate_deal(Path("D-EVAL-VIOL-1".to_string()), State(state(&pool)))
            .await
            .expect("evaluate")
            .0;

        assert_eq!(response.deal.guardrail_status, GuardrailStatus::Violated);
        assert_eq!(
            response.verdict.required_steps,
            vec![ApprovalStep::FinanceReview, ApprovalStep::ExecutiveApproval]
        );
        assert_eq!(response.chain.len(), 2);
        assert_eq!(response.chain[0].step, ApprovalStep::FinanceReview);
        assert_eq!(response.chain[0].status, ApprovalStatus::Pending);

        let stored = deals
            .find_by_id(&DealId("D-EVAL-VIOL-1".to_string()))
            .await
            .expect("find")
            .expect("deal exists");
        assert_eq!(stored.guardrail_status, GuardrailStatus::Violated);
        assert!(stored.guardrail_reason.is_some());

        let events = SqlOutboxRepository::new(pool.clone())
            .events_for_deal(&DealId("D-EVAL-VIOL-1".to_string()))
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_types::GUARDRAIL_VIOLATION);

        pool.close().await;
    }

    #[tokio::test]
    async fn re_evaluation_cancels_the_open_chain_and_routes_afresh() {
        let pool = setup().await;
        SqlDealRepository::new(pool.clone())
            .save(deal_fixture(
                "D-EVAL-AGAIN-1",
                RiskTier::Medium,
                Decimal::new(250, 1),
                DealStage::Pricing,
            ))
            .await
            .expect("seed deal");

        evaluate_deal(Path("D-EVAL-AGAIN-1".to_string()), State(state(&pool)))
            .await
            .expect("first");
        let response = evaluate_deal(Path("D-EVAL-AGAIN-1".to_string()), State(state(&pool)))
            .await
            .expect("second")
            .0;

        assert_eq!(response.chain.len(), 2);
        let cancelled = response
            .chain
            .iter()
            .filter(|approval| approval.status == ApprovalStatus::Cancelled)
            .count();
        let pending = response
            .chain
            .iter()
            .filter(|approval| approval.status == ApprovalStatus::Pending)
            .count();
        assert_eq!((cancelled, pending), (1, 1));

        pool.close().await;
    }

    #[tokio::test]
    async fn compliant_deal_passes_without_a_chain() {
        let pool = setup().await;
        SqlDealRepository::new(pool.clone())
            .save(deal_fixture(
                "D-EVAL-PASS-1",
                RiskTier::Low,
                Decimal::new(50, 1),
                DealStage::Pricing,
            ))
            .await
            .expect("seed deal");

        let response = evaluate_deal(Path("D-EVAL-PASS-1".to_string()), State(state(&pool)))
            .await
            .expect("evaluate")
            .0;

        assert_eq!(response.deal.guardrail_status, GuardrailStatus::Pass);
        assert!(response.chain.is_empty());

        let chain = SqlApprovalRepository::new(pool.clone())
            .chain_for_deal(&DealId("D-EVAL-PASS-1".to_string()))
            .await
            .expect("chain");
        assert!(chain.is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_deal_is_a_404() {
        let pool = setup().await;

        let error = evaluate_deal(Path("D-404".to_string()), State(state(&pool)))
            .await
            .expect_err("missing deal");
        assert_eq!(error.0, StatusCode::NOT_FOUND);

        pool.close().await;
    }

    #[tokio::test]
    async fn closing_won_emits_the_closure_event() {
        let pool = setup().await;
        SqlDealRepository::new(pool.clone())
            .save(deal_fixture(
                "D-STAGE-WON-1",
                RiskTier::Low,
                Decimal::new(50, 1),
                DealStage::ExecutiveApproval,
            ))
            .await
            .expect("seed deal");

        let deal = stage_deal(
            Path("D-STAGE-WON-1".to_string()),
            State(state(&pool)),
            Json(StageRequest { stage: DealStage::ClosedWon }),
        )
        .await
        .expect("close won")
        .0;

        assert_eq!(deal.stage, DealStage::ClosedWon);
        assert!(deal.payment_collected_at.is_some());

        let events = SqlOutboxRepository::new(pool.clone())
            .events_for_deal(&DealId("D-STAGE-WON-1".to_string()))
            .await
            .expect("events");
        assert!(events.iter().any(|event| event.event_type == event_types::DEAL_CLOSED_WON));

        pool.close().await;
    }

    #[tokio::test]
    async fn violated_deal_cannot_close_won() {
        let pool = setup().await;
        let mut deal = deal_fixture(
            "D-STAGE-HELD-1",
            RiskTier::Medium,
            Decimal::new(250, 1),
            DealStage::ExecutiveApproval,
        );
        deal.guardrail_status = GuardrailStatus::Violated;
        deal.guardrail_reason =
            Some("discount 25.0% exceeds 20.0% limit for medium risk".to_string());
        SqlDealRepository::new(pool.clone()).save(deal).await.expect("seed deal");

        let error = stage_deal(
            Path("D-STAGE-HELD-1".to_string()),
            State(state(&pool)),
            Json(StageRequest { stage: DealStage::ClosedWon }),
        )
        .await
        .expect_err("guardrail blocked");
        assert_eq!(error.0, StatusCode::CONFLICT);

        pool.close().await;
    }

    #[tokio::test]
    async fn stage_skips_are_refused() {
        let pool = setup().await;
        SqlDealRepository::new(pool.clone())
            .save(deal_fixture(
                "D-STAGE-SKIP-1",
                RiskTier::Low,
                Decimal::ZERO,
                DealStage::Prospecting,
            ))
            .await
            .expect("seed deal");

        let error = stage_deal(
            Path("D-STAGE-SKIP-1".to_string()),
            State(state(&pool)),
            Json(StageRequest { stage: DealStage::ClosedWon }),
        )
        .await
        .expect_err("skipping stages");
        assert_eq!(error.0, StatusCode::CONFLICT);

        pool.close().await;
    }
}
