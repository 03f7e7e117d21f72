use sqlx::{sqlite::SqliteRow, Row};

use dealgate_core::domain::deal::DealId;
use dealgate_core::domain::payment::{Payment, PaymentId, PaymentStatus};

use super::decode::{parse_decimal, parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{PaymentRepository, RepositoryError};
use crate::DbPool;

pub struct SqlPaymentRepository {
    pool: DbPool,
}

impl SqlPaymentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const PAYMENT_COLUMNS: &str = "id, deal_id, idempotency_key, parent_key, attempt_number, status,
    amount, currency, provider_reference, failure_reason, error_code, completed_at,
    rolled_back_at, auto_recovered, created_at, updated_at";

fn row_to_payment(row: SqliteRow) -> Result<Payment, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = PaymentStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown payment status `{status_raw}`"))
    })?;

    Ok(Payment {
        id: PaymentId(row.try_get("id")?),
        deal_id: DealId(row.try_get("deal_id")?),
        idempotency_key: row.try_get("idempotency_key")?,
        parent_key: row.try_get("parent_key")?,
        attempt_number: parse_u32("attempt_number", row.try_get("attempt_number")?)?,
        status,
        amount: parse_decimal("amount", &row.try_get::<String, _>("amount")?)?,
        currency: row.try_get("currency")?,
        provider_reference: row.try_get("provider_reference")?,
        failure_reason: row.try_get("failure_reason")?,
        error_code: row.try_get("error_code")?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        rolled_back_at: parse_optional_timestamp(
            "rolled_back_at",
            row.try_get("rolled_back_at")?,
        )?,
        auto_recovered: row.try_get::<i64, _>("auto_recovered")? != 0,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[async_trait::async_trait]
impl PaymentRepository for SqlPaymentRepository {
    async fn find_by_id(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_payment).transpose()
    }

    async fn find_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<Payment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE idempotency_key = ?"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_payment).transpose()
    }

    async fn attempts_for(&self, parent_key: &str) -> Result<Vec<Payment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE parent_key = ?
             ORDER BY attempt_number ASC"
        ))
        .bind(parent_key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_payment).collect()
    }

    async fn payments_for_deal(&self, deal_id: &DealId) -> Result<Vec<Payment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE deal_id = ?
             ORDER BY created_at ASC, attempt_number ASC"
        ))
        .bind(&deal_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_payment).collect()
    }

    async fn save(&self, payment: Payment) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO payments (
                id, deal_id, idempotency_key, parent_key, attempt_number, status, amount,
                currency, provider_reference, failure_reason, error_code, completed_at,
                rolled_back_at, auto_recovered, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                provider_reference = excluded.provider_reference,
                failure_reason = excluded.failure_reason,
                error_code = excluded.error_code,
                completed_at = excluded.completed_at,
                rolled_back_at = excluded.rolled_back_at,
                auto_recovered = excluded.auto_recovered,
                updated_at = excluded.updated_at",
        )
        .bind(&payment.id.0)
        .bind(&payment.deal_id.0)
        .bind(&payment.idempotency_key)
        .bind(&payment.parent_key)
        .bind(i64::from(payment.attempt_number))
        .bind(payment.status.as_str())
        .bind(payment.amount.to_string())
        .bind(&payment.currency)
        .bind(payment.provider_reference.as_deref())
        .bind(payment.failure_reason.as_deref())
        .bind(payment.error_code.as_deref())
        .bind(payment.completed_at.map(|value| value.to_rfc3339()))
        .bind(payment.rolled_back_at.map(|value| value.to_rfc3339()))
        .bind(i64::from(payment.auto_recovered))
        .bind(payment.created_at.to_rfc3339())
        .bind(payment.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
