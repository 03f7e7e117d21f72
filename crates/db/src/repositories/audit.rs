use std::collections::BTreeMap;

use sqlx::{sqlite::SqliteRow, Row};

use dealgate_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use dealgate_core::domain::deal::DealId;

use super::decode::parse_timestamp;
use super::{AuditRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAuditRepository {
    pool: DbPool,
}

impl SqlAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const AUDIT_COLUMNS: &str =
    "event_id, deal_id, correlation_id, event_type, category, actor, outcome, metadata_json,
    occurred_at";

fn row_to_event(row: SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let category_raw = row.try_get::<String, _>("category")?;
    let category = AuditCategory::parse(&category_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown audit category `{category_raw}`"))
    })?;

    let outcome_raw = row.try_get::<String, _>("outcome")?;
    let outcome = AuditOutcome::parse(&outcome_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown audit outcome `{outcome_raw}`"))
    })?;

    let metadata_raw = row.try_get::<String, _>("metadata_json")?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid audit metadata: {error}")))?;

    Ok(AuditEvent {
        event_id: row.try_get("event_id")?,
        deal_id: row.try_get::<Option<String>, _>("deal_id")?.map(DealId),
        correlation_id: row.try_get("correlation_id")?,
        event_type: row.try_get("event_type")?,
        category,
        actor: row.try_get("actor")?,
        outcome,
        metadata,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

#[async_trait::async_trait]
impl AuditRepository for SqlAuditRepository {
    async fn append(&self, event: AuditEvent) -> Result<(), RepositoryError> {
        let metadata_json = serde_json::to_string(&event.metadata).map_err(|error| {
            RepositoryError::Decode(format!("failed to encode audit metadata: {error}"))
        })?;

        sqlx::query(
            "INSERT INTO audit_events (
                event_id, deal_id, correlation_id, event_type, category, actor,
                outcome, metadata_json, occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(event.deal_id.as_ref().map(|id| id.0.as_str()))
        .bind(&event.correlation_id)
        .bind(&event.event_type)
        .bind(event.category.as_str())
        .bind(&event.actor)
        .bind(event.outcome.as_str())
        .bind(metadata_json)
        .bind(event.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn events_for_deal(&self, deal_id: &DealId) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_events
             WHERE deal_id = ?
             ORDER BY occurred_at ASC, event_id ASC"
        ))
        .bind(&deal_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    async fn recent(&self, limit: u32) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_events
             ORDER BY occurred_at DESC, event_id DESC
             LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }
}
