use crate::connection::DbPool;
use crate::repositories::RepositoryError;
use sqlx::Executor;

/// Canonical demo seeds and verification contract for the three pipelines.
const SEED_PIPELINES: &[SeedPipelineContract] = &[
    SeedPipelineContract {
        pipeline_type: "clean_collect",
        deal_id: "deal-collected-001",
        deal_name: "Northwind Traders - Platform Renewal",
        segment: Some("enterprise"),
        risk_tier: "low",
        stage: "closed_won",
        guardrail_status: "pass",
        discount_percent: "10",
        applied_policy_id: "pol-discount-enterprise-001",
        staging_id: Some("stg-collected-001"),
        invoice_number: Some("INV-20260310-00001"),
        payment_attempts: 1,
        approvals: 1,
        expected_audit_events: &[
            "guardrail.evaluated",
            "approval.completed",
            "invoice.posted",
            "payment.succeeded",
        ],
        description: "Enterprise renewal collected end to end",
    },
    SeedPipelineContract {
        pipeline_type: "guardrail_block",
        deal_id: "deal-blocked-001",
        deal_name: "Initech - Expansion Order",
        segment: Some("mid_market"),
        risk_tier: "high",
        stage: "finance_review",
        guardrail_status: "violated",
        discount_percent: "28",
        applied_policy_id: "pol-discount-global-002",
        staging_id: None,
        invoice_number: None,
        payment_attempts: 0,
        approvals: 2,
        expected_audit_events: &["guardrail.violation", "approval.escalated"],
        description: "Discount breach held in review with an escalated executive step",
    },
    SeedPipelineContract {
        pipeline_type: "payment_retry",
        deal_id: "deal-retried-001",
        deal_name: "Globex - Onboarding Bundle",
        segment: None,
        risk_tier: "medium",
        stage: "closed_won",
        guardrail_status: "pass",
        discount_percent: "5",
        applied_policy_id: "pol-discount-global-002",
        staging_id: Some("stg-retried-001"),
        invoice_number: Some("INV-20260311-00001"),
        payment_attempts: 2,
        approvals: 0,
        expected_audit_events: &["payment.failed", "payment.retried", "payment.succeeded"],
        description: "Declined card recovered by an automatic retry",
    },
];

/// Engine wording stamped on the blocked deal; verification matches it
/// byte for byte so seed and guardrail phrasing cannot drift apart.
const BLOCKED_GUARDRAIL_REASON: &str = "discount 28.0% exceeds 10.0% limit for high risk";

const SEED_DEAL_IDS: &[&str] = &["deal-collected-001", "deal-blocked-001", "deal-retried-001"];

const SEED_POLICY_IDS: &[&str] = &[
    "pol-discount-global-001",
    "pol-discount-global-002",
    "pol-discount-enterprise-001",
    "pol-terms-global-001",
    "pol-floor-global-001",
    "pol-sla-collections-001",
];

const SEED_POLICY_CONFLICT_IDS: &[&str] = &["pc-overlap-discount-001"];

const SEED_POLICY_CHANGE_IDS: &[&str] = &[
    "plc-discount-001",
    "plc-discount-002",
    "plc-discount-003",
    "plc-discount-004",
    "plc-discount-005",
];

const SEED_APPROVAL_IDS: &[&str] = &["apr-collected-001", "apr-blocked-001", "apr-blocked-002"];

const SEED_STAGING_IDS: &[&str] = &["stg-collected-001", "stg-retried-001"];

const SEED_INVOICE_IDS: &[&str] = &["inv-collected-001", "inv-retried-001"];

const SEED_PAYMENT_IDS: &[&str] = &["pay-collected-001", "pay-retried-001", "pay-retried-002"];

const SEED_OPERATION_KEYS: &[&str] = &["seed-op-collected-pay-001", "seed-op-retried-pay-001"];

const SEED_OUTBOX_IDS: &[&str] = &[
    "evt-outbox-col-001",
    "evt-outbox-col-002",
    "evt-outbox-col-003",
    "evt-outbox-blk-001",
    "evt-outbox-blk-002",
    "evt-outbox-ret-001",
    "evt-outbox-ret-002",
    "evt-outbox-ret-003",
];

const SEED_AUDIT_EVENT_IDS: &[&str] = &[
    "ae-policy-001",
    "ae-col-001",
    "ae-col-002",
    "ae-col-003",
    "ae-col-004",
    "ae-blk-001",
    "ae-blk-002",
    "ae-ret-001",
    "ae-ret-002",
    "ae-ret-003",
];

/// Demo seed dataset for the three canonical deal pipelines.
///
/// Provides deterministic fixtures for:
/// 1. A clean pipeline collected end to end
/// 2. A guardrail violation held in approval
/// 3. A failed payment recovered by automatic retry
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    /// SQL fixture content for the demo seed data.
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed_data.sql");

    /// Load the demo seed dataset into the database.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;

        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        let pipelines_seeded = SEED_PIPELINES
            .iter()
            .map(|pipeline| PipelineSeedInfo {
                pipeline_type: pipeline.pipeline_type,
                deal_id: pipeline.deal_id,
                description: pipeline.description,
            })
            .collect::<Vec<_>>();

        Ok(SeedResult { pipelines_seeded })
    }

    /// Verify that seed data exists and matches the contract.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let active_policies: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM policies WHERE status = 'active'")
                .fetch_one(pool)
                .await?;
        checks.push(("active-policies", active_policies == 4));

        let duplicate_active_scopes: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM (SELECT 1 FROM policies WHERE status = 'active' GROUP BY policy_type, scope_key HAVING COUNT(1) > 1)",
        )
        .fetch_one(pool)
        .await?;
        checks.push(("policy-exclusivity", duplicate_active_scopes == 0));

        let quoted_changes = sql_array_from_ids(SEED_POLICY_CHANGE_IDS);
        let change_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM policy_change_log WHERE id IN {quoted_changes}"
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("policy-change-log", change_count == SEED_POLICY_CHANGE_IDS.len() as i64));

        let quoted_ledger = sql_array_from_ids(SEED_OPERATION_KEYS);
        let completed_operations: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM idempotency_ledger WHERE operation_key IN {quoted_ledger} AND state = 'completed'"
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("ledger-completed", completed_operations == SEED_OPERATION_KEYS.len() as i64));

        for pipeline in SEED_PIPELINES {
            let deal_exists: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM deals WHERE id = ?1 AND stage = ?2 AND guardrail_status = ?3)",
            )
            .bind(pipeline.deal_id)
            .bind(pipeline.stage)
            .bind(pipeline.guardrail_status)
            .fetch_one(pool)
            .await?;
            checks.push((pipeline.deal_id, deal_exists == 1));

            checks.push((pipeline.terms_label(), Self::verify_deal_terms(pool, pipeline).await?));
            checks.push((pipeline.billing_label(), Self::verify_billing(pool, pipeline).await?));

            let payment_count: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM payments WHERE deal_id = ?1")
                    .bind(pipeline.deal_id)
                    .fetch_one(pool)
                    .await?;
            checks.push((pipeline.payments_label(), payment_count == pipeline.payment_attempts));

            let approval_count: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM approvals WHERE deal_id = ?1")
                    .bind(pipeline.deal_id)
                    .fetch_one(pool)
                    .await?;
            checks.push((pipeline.approvals_label(), approval_count == pipeline.approvals));

            let policy_active: i64 = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM policies WHERE id = ?1 AND status = 'active')",
            )
            .bind(pipeline.applied_policy_id)
            .fetch_one(pool)
            .await?;
            checks.push((pipeline.policy_label(), policy_active == 1));

            for event_type in pipeline.expected_audit_events {
                let event_present: i64 = sqlx::query_scalar(
                    "SELECT EXISTS(SELECT 1 FROM audit_events WHERE deal_id = ?1 AND event_type = ?2)",
                )
                .bind(pipeline.deal_id)
                .bind(event_type)
                .fetch_one(pool)
                .await?;
                checks.push((event_type, event_present == 1));
            }
        }

        let blocked_reason: Option<String> =
            sqlx::query_scalar("SELECT guardrail_reason FROM deals WHERE id = 'deal-blocked-001'")
                .fetch_one(pool)
                .await?;
        checks.push((
            "blocked-guardrail-reason",
            blocked_reason.as_deref() == Some(BLOCKED_GUARDRAIL_REASON),
        ));

        checks.push(("retry-recovered", Self::verify_retry_recovery(pool).await?));

        let escalation_pending: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM outbox_events WHERE deal_id = 'deal-blocked-001' AND event_type = 'approval.escalated' AND status = 'pending')",
        )
        .fetch_one(pool)
        .await?;
        checks.push(("escalation-outbox-pending", escalation_pending == 1));

        let all_present = checks.iter().all(|(_, exists)| *exists);
        Ok(VerificationResult { all_present, checks })
    }

    async fn verify_deal_terms(
        pool: &DbPool,
        pipeline: &SeedPipelineContract,
    ) -> Result<bool, RepositoryError> {
        let row = sqlx::query_as::<_, (Option<String>, String, String)>(
            "SELECT segment, risk_tier, discount_percent FROM deals WHERE id = ?1",
        )
        .bind(pipeline.deal_id)
        .fetch_one(pool)
        .await?;
        let (segment, risk_tier, discount_percent) = row;

        Ok(segment.as_deref() == pipeline.segment
            && risk_tier == pipeline.risk_tier
            && discount_percent == pipeline.discount_percent)
    }

    async fn verify_billing(
        pool: &DbPool,
        pipeline: &SeedPipelineContract,
    ) -> Result<bool, RepositoryError> {
        let (Some(staging_id), Some(invoice_number)) = (pipeline.staging_id, pipeline.invoice_number)
        else {
            // No billing expected; any staging row for the deal is a defect.
            let staging_count: i64 =
                sqlx::query_scalar("SELECT COUNT(1) FROM invoice_staging WHERE deal_id = ?1")
                    .bind(pipeline.deal_id)
                    .fetch_one(pool)
                    .await?;
            return Ok(staging_count == 0);
        };

        let staging_posted: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM invoice_staging WHERE id = ?1 AND deal_id = ?2 AND invoice_number = ?3 AND status = 'posted')",
        )
        .bind(staging_id)
        .bind(pipeline.deal_id)
        .bind(invoice_number)
        .fetch_one(pool)
        .await?;
        if staging_posted != 1 {
            return Ok(false);
        }

        let line_count: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM invoice_staging_lines WHERE staging_id = ?1")
                .bind(staging_id)
                .fetch_one(pool)
                .await?;
        if line_count == 0 {
            return Ok(false);
        }

        let invoice_posted: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM invoices WHERE staging_id = ?1 AND invoice_number = ?2)",
        )
        .bind(staging_id)
        .bind(invoice_number)
        .fetch_one(pool)
        .await?;
        Ok(invoice_posted == 1)
    }

    async fn verify_retry_recovery(pool: &DbPool) -> Result<bool, RepositoryError> {
        let recovered: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM payments WHERE id = 'pay-retried-002' AND attempt_number = 2 AND auto_recovered = 1 AND status = 'succeeded' AND parent_key = (SELECT parent_key FROM payments WHERE id = 'pay-retried-001'))",
        )
        .fetch_one(pool)
        .await?;
        Ok(recovered == 1)
    }

    /// Clean up seeded fixtures from a test database.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        let quoted_audits = sql_array_from_ids(SEED_AUDIT_EVENT_IDS);
        let quoted_outbox = sql_array_from_ids(SEED_OUTBOX_IDS);
        let quoted_ledger = sql_array_from_ids(SEED_OPERATION_KEYS);
        let quoted_payments = sql_array_from_ids(SEED_PAYMENT_IDS);
        let quoted_invoices = sql_array_from_ids(SEED_INVOICE_IDS);
        let quoted_stagings = sql_array_from_ids(SEED_STAGING_IDS);
        let quoted_approvals = sql_array_from_ids(SEED_APPROVAL_IDS);
        let quoted_changes = sql_array_from_ids(SEED_POLICY_CHANGE_IDS);
        let quoted_conflicts = sql_array_from_ids(SEED_POLICY_CONFLICT_IDS);
        let quoted_policies = sql_array_from_ids(SEED_POLICY_IDS);
        let quoted_deals = sql_array_from_ids(SEED_DEAL_IDS);

        sqlx::query(&format!("DELETE FROM audit_events WHERE event_id IN {quoted_audits}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM outbox_events WHERE id IN {quoted_outbox}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "DELETE FROM idempotency_ledger WHERE operation_key IN {quoted_ledger}"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!("DELETE FROM payments WHERE id IN {quoted_payments}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM invoices WHERE id IN {quoted_invoices}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "DELETE FROM invoice_staging_lines WHERE staging_id IN {quoted_stagings}"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "DELETE FROM invoice_staging_taxes WHERE staging_id IN {quoted_stagings}"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!("DELETE FROM invoice_staging WHERE id IN {quoted_stagings}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM approvals WHERE id IN {quoted_approvals}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM policy_change_log WHERE id IN {quoted_changes}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM policy_conflicts WHERE id IN {quoted_conflicts}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM policies WHERE id IN {quoted_policies}"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("DELETE FROM deals WHERE id IN {quoted_deals}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct SeedPipelineContract {
    pipeline_type: &'static str,
    deal_id: &'static str,
    deal_name: &'static str,
    segment: Option<&'static str>,
    risk_tier: &'static str,
    stage: &'static str,
    guardrail_status: &'static str,
    discount_percent: &'static str,
    applied_policy_id: &'static str,
    staging_id: Option<&'static str>,
    invoice_number: Option<&'static str>,
    payment_attempts: i64,
    approvals: i64,
    expected_audit_events: &'static [&'static str],
    description: &'static str,
}

impl SeedPipelineContract {
    fn terms_label(&self) -> &'static str {
        match self.pipeline_type {
            "clean_collect" => "deal-collected-terms",
            "guardrail_block" => "deal-blocked-terms",
            _ => "deal-retried-terms",
        }
    }

    fn billing_label(&self) -> &'static str {
        match self.pipeline_type {
            "clean_collect" => "pipeline-collected-billing",
            "guardrail_block" => "pipeline-blocked-billing",
            _ => "pipeline-retried-billing",
        }
    }

    fn payments_label(&self) -> &'static str {
        match self.pipeline_type {
            "clean_collect" => "pipeline-collected-payments",
            "guardrail_block" => "pipeline-blocked-payments",
            _ => "pipeline-retried-payments",
        }
    }

    fn approvals_label(&self) -> &'static str {
        match self.pipeline_type {
            "clean_collect" => "pipeline-collected-approvals",
            "guardrail_block" => "pipeline-blocked-approvals",
            _ => "pipeline-retried-approvals",
        }
    }

    fn policy_label(&self) -> &'static str {
        match self.pipeline_type {
            "clean_collect" => "pipeline-collected-policy",
            "guardrail_block" => "pipeline-blocked-policy",
            _ => "pipeline-retried-policy",
        }
    }
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug)]
pub struct SeedResult {
    pub pipelines_seeded: Vec<PipelineSeedInfo>,
}

#[derive(Debug)]
pub struct PipelineSeedInfo {
    pub pipeline_type: &'static str,
    pub deal_id: &'static str,
    pub description: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{connect_with_settings, migrations};

    #[test]
    fn sql_fixture_is_valid() {
        assert!(!DemoSeedDataset::SQL.is_empty());
    }

    #[tokio::test]
    async fn verify_seed_contract_and_idempotency() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");

        migrations::run_pending(&pool).await.expect("run migrations");

        let first = DemoSeedDataset::load(&pool).await.expect("load seed fixtures");
        let first_verification =
            DemoSeedDataset::verify(&pool).await.expect("verify seed fixtures");
        let failed = first_verification
            .checks
            .iter()
            .filter(|(_, ok)| !ok)
            .map(|(label, _)| *label)
            .collect::<Vec<_>>();
        assert!(first_verification.all_present, "failed checks: {failed:?}");
        assert_eq!(first.pipelines_seeded.len(), 3);

        let second = DemoSeedDataset::load(&pool).await.expect("reload seed fixtures");
        let second_verification =
            DemoSeedDataset::verify(&pool).await.expect("re-verify seed fixtures");
        assert!(second_verification.all_present);
        assert_eq!(second.pipelines_seeded.len(), 3);
        assert_eq!(first_verification.checks, second_verification.checks);
    }

    #[tokio::test]
    async fn verify_seed_pipeline_specific_properties() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");

        migrations::run_pending(&pool).await.expect("run migrations");

        DemoSeedDataset::load(&pool).await.expect("load seed fixtures");

        let blocked_reason: Option<String> =
            sqlx::query_scalar("SELECT guardrail_reason FROM deals WHERE id = ?1")
                .bind("deal-blocked-001")
                .fetch_one(&pool)
                .await
                .expect("query blocked guardrail reason");
        assert_eq!(blocked_reason.as_deref(), Some(BLOCKED_GUARDRAIL_REASON));

        let collected_at: Option<String> =
            sqlx::query_scalar("SELECT payment_collected_at FROM deals WHERE id = ?1")
                .bind("deal-collected-001")
                .fetch_one(&pool)
                .await
                .expect("query collected timestamp");
        assert!(collected_at.is_some());

        let (attempt_number, auto_recovered): (i64, i64) = sqlx::query_as(
            "SELECT attempt_number, auto_recovered FROM payments WHERE id = ?1",
        )
        .bind("pay-retried-002")
        .fetch_one(&pool)
        .await
        .expect("query recovery payment");
        assert_eq!(attempt_number, 2);
        assert_eq!(auto_recovered, 1);

        let ledger_attempts: i64 = sqlx::query_scalar(
            "SELECT attempt_count FROM idempotency_ledger WHERE operation_key = ?1",
        )
        .bind("seed-op-retried-pay-001")
        .fetch_one(&pool)
        .await
        .expect("query retried ledger row");
        assert_eq!(ledger_attempts, 2);

        let escalated_status: String =
            sqlx::query_scalar("SELECT status FROM approvals WHERE id = ?1")
                .bind("apr-blocked-002")
                .fetch_one(&pool)
                .await
                .expect("query escalated approval");
        assert_eq!(escalated_status, "escalated");
    }

    #[tokio::test]
    async fn clean_removes_every_seeded_row() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect to test database");

        migrations::run_pending(&pool).await.expect("run migrations");

        DemoSeedDataset::load(&pool).await.expect("load seed fixtures");
        DemoSeedDataset::clean(&pool).await.expect("clean seed fixtures");

        for table in ["deals", "policies", "approvals", "invoice_staging", "payments",
            "outbox_events", "audit_events"]
        {
            let remaining: i64 = sqlx::query_scalar(&format!("SELECT COUNT(1) FROM {table}"))
                .fetch_one(&pool)
                .await
                .expect("count remaining rows");
            assert_eq!(remaining, 0, "{table} should be empty after clean");
        }
    }

    #[test]
    fn seed_contract_json_matches_rust_seed_constants() {
        let contract: serde_json::Value =
            serde_json::from_str(include_str!("../../../config/fixtures/demo_seed_contract.json"))
                .expect("demo seed contract JSON must parse");

        assert_eq!(contract["dataset_version"].as_str(), Some("2026.03.1"));
        assert_eq!(contract["seed_dataset"].as_str(), Some("deterministic_demo_pipelines"));

        let contract_pipelines =
            contract["pipelines"].as_array().expect("pipelines should be an array");
        assert_eq!(contract_pipelines.len(), SEED_PIPELINES.len());

        for pipeline in SEED_PIPELINES {
            let contract_pipeline = contract_pipelines
                .iter()
                .find(|candidate| candidate["pipeline_type"].as_str() == Some(pipeline.pipeline_type))
                .expect("contract should include all canonical pipeline types");

            assert_eq!(contract_pipeline["deal_id"].as_str(), Some(pipeline.deal_id));
            assert_eq!(contract_pipeline["deal_name"].as_str(), Some(pipeline.deal_name));
            assert_eq!(contract_pipeline["segment"].as_str(), pipeline.segment);
            assert_eq!(contract_pipeline["risk_tier"].as_str(), Some(pipeline.risk_tier));
            assert_eq!(contract_pipeline["stage"].as_str(), Some(pipeline.stage));
            assert_eq!(
                contract_pipeline["guardrail_status"].as_str(),
                Some(pipeline.guardrail_status)
            );
            assert_eq!(
                contract_pipeline["discount_percent"].as_str(),
                Some(pipeline.discount_percent)
            );
            assert_eq!(
                contract_pipeline["applied_policy_id"].as_str(),
                Some(pipeline.applied_policy_id)
            );
            assert_eq!(contract_pipeline["staging_id"].as_str(), pipeline.staging_id);
            assert_eq!(contract_pipeline["invoice_number"].as_str(), pipeline.invoice_number);
            assert_eq!(
                contract_pipeline["payment_attempts"].as_i64(),
                Some(pipeline.payment_attempts)
            );
            assert_eq!(contract_pipeline["approvals"].as_i64(), Some(pipeline.approvals));
            assert_eq!(
                contract_pipeline["expected_audit_events"]
                    .as_array()
                    .expect("expected_audit_events should be an array")
                    .iter()
                    .map(|value| value.as_str().unwrap_or_default())
                    .collect::<Vec<_>>(),
                pipeline.expected_audit_events
            );
        }
    }
}
