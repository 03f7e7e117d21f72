//! Approval chain routes.
//!
//! Endpoints:
//! - `POST /api/approvals/{approval_id}/complete` — record a reviewer's
//!   decision on the chain's current step
//! - `POST /api/approvals/{approval_id}/escalate` — flag an overdue step

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use dealgate_core::approval_router::{
    ApprovalDecision, ApprovalRouter, ChainOutcome, EscalationOutcome,
};
use dealgate_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use dealgate_core::config::GuardrailConfig;
use dealgate_core::domain::approval::{Approval, ApprovalId};
use dealgate_core::domain::deal::Deal;
use dealgate_core::domain::event::event_types;
use dealgate_core::errors::DomainError;
use dealgate_db::repositories::{
    ApprovalRepository, DealRepository, SqlApprovalRepository, SqlDealRepository,
};
use dealgate_db::DbPool;

use crate::api::{self, ErrorReply};

#[derive(Clone)]
pub struct ApprovalsState {
    db_pool: DbPool,
    limits: GuardrailConfig,
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub outcome: &'static str,
    pub deal: Deal,
    pub chain: Vec<Approval>,
}

#[derive(Debug, Serialize)]
pub struct EscalateResponse {
    pub outcome: &'static str,
    pub approval: Approval,
}

pub fn router(db_pool: DbPool, limits: GuardrailConfig) -> Router {
    Router::new()
        .route("/api/approvals/{approval_id}/complete", post(complete_step))
        .route("/api/approvals/{approval_id}/escalate", post(escalate_step))
        .with_state(ApprovalsState { db_pool, limits })
}

fn chain_label(outcome: ChainOutcome) -> &'static str {
    match outcome {
        ChainOutcome::AwaitingNext => "awaiting_next",
        ChainOutcome::Approved => "approved",
        ChainOutcome::Rejected => "rejected",
    }
}

async fn complete_step(
    Path(approval_id): Path<String>,
    State(state): State<ApprovalsState>,
    Json(decision): Json<ApprovalDecision>,
) -> Result<Json<CompleteResponse>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let approvals = SqlApprovalRepository::new(state.db_pool.clone());
    let deals = SqlDealRepository::new(state.db_pool.clone());

    let approval_id = ApprovalId(approval_id);
    let approval = approvals
        .find_by_id(&approval_id)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .ok_or_else(|| api::not_found("approval", &approval_id.0, &correlation_id))?;

    let mut deal = deals
        .find_by_id(&approval.deal_id)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .ok_or_else(|| api::not_found("deal", &approval.deal_id.0, &correlation_id))?;
    let mut chain = approvals
        .chain_for_deal(&deal.id)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    let outcome = ApprovalRouter::new(state.limits.clone())
        .complete(&mut deal, &mut chain, &approval_id, &decision, now)
        .map_err(|error| api::error_reply(error.into(), &correlation_id))?;

    for step in &chain {
        approvals
            .save(step.clone())
            .await
            .map_err(|error| api::db_error(error, &correlation_id))?;
    }
    deals
        .save(deal.clone())
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    let audit_outcome = match outcome {
        ChainOutcome::Rejected => AuditOutcome::Rejected,
        _ => AuditOutcome::Success,
    };
    api::record_audit(
        &state.db_pool,
        AuditEvent::new(
            Some(deal.id.clone()),
            &correlation_id,
            "approval.completed",
            AuditCategory::Approval,
            "approval-router",
            audit_outcome,
        )
        .with_metadata("step", approval.step.as_str())
        .with_metadata("chain", chain_label(outcome)),
    )
    .await;

    info!(
        event_name = "api.approvals.completed",
        correlation_id = %correlation_id,
        deal_id = %deal.id,
        approval_id = %approval_id.0,
        step = approval.step.as_str(),
        outcome = chain_label(outcome),
        "approval step completed"
    );

    Ok(Json(CompleteResponse { outcome: chain_label(outcome), deal, chain }))
}

async fn escalate_step(
    Path(approval_id): Path<String>,
    State(state): State<ApprovalsState>,
) -> Result<Json<EscalateResponse>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let approvals = SqlApprovalRepository::new(state.db_pool.clone());
    let approval_id = ApprovalId(approval_id);
    let approval = approvals
        .find_by_id(&approval_id)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .ok_or_else(|| api::not_found("approval", &approval_id.0, &correlation_id))?;

    let mut chain = approvals
        .chain_for_deal(&approval.deal_id)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    let outcome = ApprovalRouter::new(state.limits.clone())
        .escalate(&mut chain, &approval_id, now)
        .map_err(|error| api::error_reply(DomainError::from(error).into(), &correlation_id))?;

    let step = chain
        .iter()
        .find(|step| step.id == approval_id)
        .cloned()
        .ok_or_else(|| api::not_found("approval", &approval_id.0, &correlation_id))?;

    if outcome == EscalationOutcome::Escalated {
        approvals
            .save(step.clone())
            .await
            .map_err(|error| api::db_error(error, &correlation_id))?;

        api::enqueue_event(
            &state.db_pool,
            Some(approval.deal_id.clone()),
            event_types::APPROVAL_ESCALATED,
            serde_json::json!({
                "approval_id": approval_id.0,
                "deal_id": approval.deal_id.0,
                "step": step.step.as_str(),
                "due_at": step.due_at,
            }),
            now,
        )
        .await;

        api::record_audit(
            &state.db_pool,
            AuditEvent::new(
                Some(approval.deal_id.clone()),
                &correlation_id,
                "approval.escalated",
                AuditCategory::Approval,
                "approval-router",
                AuditOutcome::Success,
            )
            .with_metadata("step", step.step.as_str()),
        )
        .await;
    }

    let label = match outcome {
        EscalationOutcome::Escalated => "escalated",
        EscalationOutcome::Unchanged => "unchanged",
    };
    info!(
        event_name = "api.approvals.escalated",
        correlation_id = %correlation_id,
        deal_id = %approval.deal_id,
        approval_id = %approval_id.0,
        outcome = label,
        "approval escalation check"
    );

    Ok(Json(EscalateResponse { outcome: label, approval: step }))
}

#[cfg(test)]
mod tests {
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::Json;
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;

    use dealgate_core::approval_router::{ApprovalDecision, ApprovalRouter};
    use dealgate_core::config::AppConfig;
    use dealgate_core::domain::approval::{Approval, ApprovalStatus, ApprovalStep};
    use dealgate_core::domain::deal::{
        Deal, DealId, DealStage, GuardrailStatus, RiskTier,
    };
    use dealgate_core::domain::event::event_types;
    use dealgate_core::guardrails::GuardrailVerdict;
    use dealgate_db::repositories::{
        ApprovalRepository, DealRepository, OutboxRepository, SqlApprovalRepository,
        SqlDealRepository, SqlOutboxRepository,
    };
    use dealgate_db::{connect_with_settings, migrations, DbPool};

    use super::{complete_step, escalate_step, ApprovalsState};

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn state(pool: &DbPool) -> ApprovalsState {
        ApprovalsState { db_pool: pool.clone(), limits: AppConfig::default().guardrails }
    }

    fn violated_deal(id: &str, stage: DealStage) -> Deal {
        let now = Utc::now();
        Deal {
            id: DealId(id.to_string()),
            name: "Globex renewal".to_string(),
            amount: Decimal::new(18_000_000, 2),
            currency: "USD".to_string(),
            discount_percent: Decimal::new(250, 1),
            payment_terms_days: 30,
            risk: RiskTier::Medium,
            segment: None,
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
            created_at: now,
            updated_at: now,
        }
    }

    /// Routes a fresh two-step chain for `deal` at `routed_at` and persists
    /// both rows.
    async fn seed_chain(pool: &DbPool, deal: &Deal, routed_at: DateTime<Utc>) -> Vec<Approval> {
        let verdict = GuardrailVerdict {
            status: GuardrailStatus::Violated,
            violations: Vec::new(),
            required_steps: vec![ApprovalStep::FinanceReview, ApprovalStep::ExecutiveApproval],
            evaluated_at: routed_at,
        };
        let chain = ApprovalRouter::new(AppConfig::default().guardrails)
            .route(deal, &verdict, &mut [], routed_at)
            .expect("route chain");
        let approvals = SqlApprovalRepository::new(pool.clone());
        for step in &chain {
            approvals.save(step.clone()).await.expect("seed approval");
        }
        chain
    }

    #[tokio::test]
    async fn approving_every_step_locks_the_deal() {
        let pool = setup().await;
        let deal = violated_deal("D-10", DealStage::ExecutiveApproval);
        SqlDealRepository::new(pool.clone()).save(deal.clone()).await.expect("seed deal");
        let chain = seed_chain(&pool, &deal, Utc::now()).await;

        let first = complete_step(
            Path(chain[0].id.0.clone()),
            State(state(&pool)),
            Json(ApprovalDecision::approve("fin-1")),
        )
        .await
        .expect("first step")
        .0;
        assert_eq!(first.outcome, "awaiting_next");
        assert!(!first.deal.guardrail_locked);

        let second = complete_step(
            Path(chain[1].id.0.clone()),
            State(state(&pool)),
            Json(ApprovalDecision::approve("exec-1")),
        )
        .await
        .expect("second step")
        .0;
        assert_eq!(second.outcome, "approved");
        assert_eq!(second.deal.guardrail_status, GuardrailStatus::Pass);
        assert!(second.deal.guardrail_locked);

        let stored = SqlDealRepository::new(pool.clone())
            .find_by_id(&DealId("D-10".to_string()))
            .await
            .expect("find")
            .expect("deal exists");
        assert!(stored.guardrail_locked);
        assert_eq!(stored.guardrail_reason, None);

        pool.close().await;
    }

    #[tokio::test]
    async fn rejection_reverts_the_deal_and_cancels_the_rest() {
        let pool = setup().await;
        let deal = violated_deal("D-11", DealStage::FinanceReview);
        SqlDealRepository::new(pool.clone()).save(deal.clone()).await.expect("seed deal");
        let chain = seed_chain(&pool, &deal, Utc::now()).await;

        let response = complete_step(
            Path(chain[0].id.0.clone()),
            State(state(&pool)),
            Json(ApprovalDecision::reject("fin-1", "margin too thin")),
        )
        .await
        .expect("reject")
        .0;

        assert_eq!(response.outcome, "rejected");
        assert_eq!(response.deal.stage, DealStage::Pricing);
        assert_eq!(response.deal.guardrail_status, GuardrailStatus::Violated);

        let stored = SqlApprovalRepository::new(pool.clone())
            .chain_for_deal(&DealId("D-11".to_string()))
            .await
            .expect("chain");
        assert_eq!(stored[0].status, ApprovalStatus::Rejected);
        assert_eq!(stored[0].notes.as_deref(), Some("margin too thin"));
        assert_eq!(stored[1].status, ApprovalStatus::Cancelled);

        pool.close().await;
    }

    #[tokio::test]
    async fn out_of_order_completion_is_a_conflict() {
        let pool = setup().await;
        let deal = violated_deal("D-12", DealStage::FinanceReview);
        SqlDealRepository::new(pool.clone()).save(deal.clone()).await.expect("seed deal");
        let chain = seed_chain(&pool, &deal, Utc::now()).await;

        let error = complete_step(
            Path(chain[1].id.0.clone()),
            State(state(&pool)),
            Json(ApprovalDecision::approve("exec-1")),
        )
        .await
        .expect_err("skipped the finance step");
        assert_eq!(error.0, StatusCode::CONFLICT);

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_approval_is_a_404() {
        let pool = setup().await;

        let error = complete_step(
            Path("A-404".to_string()),
            State(state(&pool)),
            Json(ApprovalDecision::approve("fin-1")),
        )
        .await
        .expect_err("missing approval");
        assert_eq!(error.0, StatusCode::NOT_FOUND);

        pool.close().await;
    }

    #[tokio::test]
    async fn escalating_an_overdue_step_emits_one_event() {
        let pool = setup().await;
        let deal = violated_deal("D-13", DealStage::FinanceReview);
        SqlDealRepository::new(pool.clone()).save(deal.clone()).await.expect("seed deal");
        // Routed 25h ago, so the 24h finance step is past due.
        let chain = seed_chain(&pool, &deal, Utc::now() - Duration::hours(25)).await;

        let first = escalate_step(Path(chain[0].id.0.clone()), State(state(&pool)))
            .await
            .expect("escalate")
            .0;
        assert_eq!(first.outcome, "escalated");
        assert_eq!(first.approval.status, ApprovalStatus::Escalated);

        let repeated = escalate_step(Path(chain[0].id.0.clone()), State(state(&pool)))
            .await
            .expect("repeat")
            .0;
        assert_eq!(repeated.outcome, "unchanged");

        let events = SqlOutboxRepository::new(pool.clone())
            .events_for_deal(&DealId("D-13".to_string()))
            .await
            .expect("events");
        let escalations = events
            .iter()
            .filter(|event| event.event_type == event_types::APPROVAL_ESCALATED)
            .count();
        assert_eq!(escalations, 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn escalation_within_sla_changes_nothing() {
        let pool = setup().await;
        let deal = violated_deal("D-14", DealStage::FinanceReview);
        SqlDealRepository::new(pool.clone()).save(deal.clone()).await.expect("seed deal");
        let chain = seed_chain(&pool, &deal, Utc::now()).await;

        let response = escalate_step(Path(chain[0].id.0.clone()), State(state(&pool)))
            .await
            .expect("escalate")
            .0;
        assert_eq!(response.outcome, "unchanged");
        assert_eq!(response.approval.status, ApprovalStatus::Pending);

        pool.close().await;
    }

    #[tokio::test]
    async fn escalation_ignores_completed_steps() {
        let pool = setup().await;
        let deal = violated_deal("D-15", DealStage::FinanceReview);
        SqlDealRepository::new(pool.clone()).save(deal.clone()).await.expect("seed deal");
        let chain = seed_chain(&pool, &deal, Utc::now() - Duration::hours(25)).await;

        complete_step(
            Path(chain[0].id.0.clone()),
            State(state(&pool)),
            Json(ApprovalDecision::approve("fin-1")),
        )
        .await
        .expect("approve first");

        let response = escalate_step(Path(chain[0].id.0.clone()), State(state(&pool)))
            .await
            .expect("escalate resolved step")
            .0;
        assert_eq!(response.outcome, "unchanged");
        assert_eq!(response.approval.status, ApprovalStatus::Approved);

        pool.close().await;
    }
}
