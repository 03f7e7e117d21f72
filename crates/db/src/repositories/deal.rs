use sqlx::{sqlite::SqliteRow, Row};

use dealgate_core::domain::deal::{Deal, DealId, DealStage, GuardrailStatus, RiskTier};

use super::decode::{parse_decimal, parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{DealRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDealRepository {
    pool: DbPool,
}

impl SqlDealRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const DEAL_COLUMNS: &str = "id, name, amount, currency, discount_percent, payment_terms_days,
    risk_tier, segment, stage, guardrail_status, guardrail_reason, guardrail_locked,
    operational_cost, quote_generated_at, agreement_signed_at, payment_collected_at,
    created_at, updated_at";

fn row_to_deal(row: SqliteRow) -> Result<Deal, RepositoryError> {
    let risk_raw = row.try_get::<String, _>("risk_tier")?;
    let risk = RiskTier::parse(&risk_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown risk tier `{risk_raw}`")))?;

    let stage_raw = row.try_get::<String, _>("stage")?;
    let stage = DealStage::parse(&stage_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown deal stage `{stage_raw}`")))?;

    let guardrail_raw = row.try_get::<String, _>("guardrail_status")?;
    let guardrail_status = GuardrailStatus::parse(&guardrail_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown guardrail status `{guardrail_raw}`"))
    })?;

    Ok(Deal {
        id: DealId(row.try_get("id")?),
        name: row.try_get("name")?,
        amount: parse_decimal("amount", &row.try_get::<String, _>("amount")?)?,
        currency: row.try_get("currency")?,
        discount_percent: parse_decimal(
            "discount_percent",
            &row.try_get::<String, _>("discount_percent")?,
        )?,
        payment_terms_days: parse_u32("payment_terms_days", row.try_get("payment_terms_days")?)?,
        risk,
        segment: row.try_get("segment")?,
        stage,
        guardrail_status,
        guardrail_reason: row.try_get("guardrail_reason")?,
        guardrail_locked: row.try_get::<i64, _>("guardrail_locked")? != 0,
        operational_cost: parse_decimal(
            "operational_cost",
            &row.try_get::<String, _>("operational_cost")?,
        )?,
        quote_generated_at: parse_optional_timestamp(
            "quote_generated_at",
            row.try_get("quote_generated_at")?,
        )?,
        agreement_signed_at: parse_optional_timestamp(
            "agreement_signed_at",
            row.try_get("agreement_signed_at")?,
        )?,
        payment_collected_at: parse_optional_timestamp(
            "payment_collected_at",
            row.try_get("payment_collected_at")?,
        )?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[async_trait::async_trait]
impl DealRepository for SqlDealRepository {
    async fn find_by_id(&self, id: &DealId) -> Result<Option<Deal>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {DEAL_COLUMNS} FROM deals WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_deal).transpose()
    }

    async fn list(&self, stage: Option<DealStage>) -> Result<Vec<Deal>, RepositoryError> {
        let rows = if let Some(stage) = stage {
            sqlx::query(&format!(
                "SELECT {DEAL_COLUMNS} FROM deals WHERE stage = ? ORDER BY created_at ASC, id ASC"
            ))
            .bind(stage.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {DEAL_COLUMNS} FROM deals ORDER BY created_at ASC, id ASC"
            ))
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(row_to_deal).collect()
    }

    async fn save(&self, deal: Deal) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO deals (
                id, name, amount, currency, discount_percent, payment_terms_days,
                risk_tier, segment, stage, guardrail_status, guardrail_reason,
                guardrail_locked, operational_cost, quote_generated_at,
                agreement_signed_at, payment_collected_at, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                amount = excluded.amount,
                currency = excluded.currency,
                discount_percent = excluded.discount_percent,
                payment_terms_days = excluded.payment_terms_days,
                risk_tier = excluded.risk_tier,
                segment = excluded.segment,
                stage = excluded.stage,
                guardrail_status = excluded.guardrail_status,
                guardrail_reason = excluded.guardrail_reason,
                guardrail_locked = excluded.guardrail_locked,
                operational_cost = excluded.operational_cost,
                quote_generated_at = excluded.quote_generated_at,
                agreement_signed_at = excluded.agreement_signed_at,
                payment_collected_at = excluded.payment_collected_at,
                updated_at = excluded.updated_at",
        )
        .bind(&deal.id.0)
        .bind(&deal.name)
        .bind(deal.amount.to_string())
        .bind(&deal.currency)
        .bind(deal.discount_percent.to_string())
        .bind(i64::from(deal.payment_terms_days))
        .bind(deal.risk.as_str())
        .bind(deal.segment.as_deref())
        .bind(deal.stage.as_str())
        .bind(deal.guardrail_status.as_str())
        .bind(deal.guardrail_reason.as_deref())
        .bind(i64::from(deal.guardrail_locked))
        .bind(deal.operational_cost.to_string())
        .bind(deal.quote_generated_at.map(|value| value.to_rfc3339()))
        .bind(deal.agreement_signed_at.map(|value| value.to_rfc3339()))
        .bind(deal.payment_collected_at.map(|value| value.to_rfc3339()))
        .bind(deal.created_at.to_rfc3339())
        .bind(deal.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
