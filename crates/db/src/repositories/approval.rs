use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use dealgate_core::domain::approval::{Approval, ApprovalId, ApprovalStatus, ApprovalStep};
use dealgate_core::domain::deal::DealId;

use super::decode::{parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{ApprovalRepository, RepositoryError};
use crate::DbPool;

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const APPROVAL_COLUMNS: &str = "id, deal_id, step, sequence_order, status, approver_id, notes,
    due_at, completed_at, created_at, updated_at";

fn row_to_approval(row: SqliteRow) -> Result<Approval, RepositoryError> {
    let step_raw = row.try_get::<String, _>("step")?;
    let step = ApprovalStep::parse(&step_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval step `{step_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = ApprovalStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown approval status `{status_raw}`"))
    })?;

    Ok(Approval {
        id: ApprovalId(row.try_get("id")?),
        deal_id: DealId(row.try_get("deal_id")?),
        step,
        sequence_order: parse_u32("sequence_order", row.try_get("sequence_order")?)?,
        status,
        approver_id: row.try_get("approver_id")?,
        notes: row.try_get("notes")?,
        due_at: parse_timestamp("due_at", row.try_get("due_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[async_trait::async_trait]
impl ApprovalRepository for SqlApprovalRepository {
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_approval).transpose()
    }

    async fn chain_for_deal(&self, deal_id: &DealId) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals
             WHERE deal_id = ?
             ORDER BY sequence_order ASC"
        ))
        .bind(&deal_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_approval).collect()
    }

    async fn open_past_due(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals
             WHERE status IN ('pending', 'escalated') AND due_at < ?
             ORDER BY due_at ASC"
        ))
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_approval).collect()
    }

    async fn save(&self, approval: Approval) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO approvals (
                id, deal_id, step, sequence_order, status, approver_id, notes,
                due_at, completed_at, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                approver_id = excluded.approver_id,
                notes = excluded.notes,
                due_at = excluded.due_at,
                completed_at = excluded.completed_at,
                updated_at = excluded.updated_at",
        )
        .bind(&approval.id.0)
        .bind(&approval.deal_id.0)
        .bind(approval.step.as_str())
        .bind(i64::from(approval.sequence_order))
        .bind(approval.status.as_str())
        .bind(approval.approver_id.as_deref())
        .bind(approval.notes.as_deref())
        .bind(approval.due_at.to_rfc3339())
        .bind(approval.completed_at.map(|value| value.to_rfc3339()))
        .bind(approval.created_at.to_rfc3339())
        .bind(approval.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
