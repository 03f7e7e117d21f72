use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use dealgate_core::domain::deal::DealId;
use dealgate_core::domain::event::{EventStatus, OutboxEvent};

use super::decode::{parse_json, parse_timestamp, parse_u32};
use super::{OutboxRepository, RepositoryError};
use crate::DbPool;

pub struct SqlOutboxRepository {
    pool: DbPool,
}

impl SqlOutboxRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const EVENT_COLUMNS: &str = "id, deal_id, event_type, payload_json, channel, status, attempts,
    last_error, next_run_at, created_at, updated_at";

fn row_to_event(row: SqliteRow) -> Result<OutboxEvent, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = EventStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event status `{status_raw}`")))?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        deal_id: row.try_get::<Option<String>, _>("deal_id")?.map(DealId),
        event_type: row.try_get("event_type")?,
        payload: parse_json("payload_json", &row.try_get::<String, _>("payload_json")?)?,
        channel: row.try_get("channel")?,
        status,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        last_error: row.try_get("last_error")?,
        next_run_at: parse_timestamp("next_run_at", row.try_get("next_run_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[async_trait::async_trait]
impl OutboxRepository for SqlOutboxRepository {
    async fn save(&self, event: OutboxEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO outbox_events (
                id, deal_id, event_type, payload_json, channel, status, attempts,
                last_error, next_run_at, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                next_run_at = excluded.next_run_at,
                updated_at = excluded.updated_at",
        )
        .bind(&event.id)
        .bind(event.deal_id.as_ref().map(|id| id.0.as_str()))
        .bind(&event.event_type)
        .bind(event.payload.to_string())
        .bind(&event.channel)
        .bind(event.status.as_str())
        .bind(i64::from(event.attempts))
        .bind(event.last_error.as_deref())
        .bind(event.next_run_at.to_rfc3339())
        .bind(event.created_at.to_rfc3339())
        .bind(event.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<OutboxEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events
             WHERE status != 'dispatched' AND next_run_at <= ?
             ORDER BY next_run_at ASC, created_at ASC
             LIMIT ?"
        ))
        .bind(now.to_rfc3339())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }

    async fn events_for_deal(&self, deal_id: &DealId) -> Result<Vec<OutboxEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox_events
             WHERE deal_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&deal_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use dealgate_core::domain::deal::DealId;
    use dealgate_core::domain::event::{event_types, EventStatus, OutboxEvent};

    use super::SqlOutboxRepository;
    use crate::migrations;
    use crate::repositories::OutboxRepository;
    use crate::{connect_with_settings, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn sample_event(id: &str, event_type: &str) -> OutboxEvent {
        let now = parse_ts("2026-03-14T12:00:00Z");
        OutboxEvent {
            id: id.to_string(),
            deal_id: Some(DealId("D-100".to_string())),
            event_type: event_type.to_string(),
            payload: serde_json::json!({"deal_id": "D-100"}),
            channel: "workflow".to_string(),
            status: EventStatus::Pending,
            attempts: 0,
            last_error: None,
            next_run_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_and_read_back_round_trips_every_field() {
        let pool = setup_pool().await;
        let repo = SqlOutboxRepository::new(pool.clone());

        let event = sample_event("EVT-1", event_types::PAYMENT_SUCCEEDED);
        repo.save(event.clone()).await.expect("save");

        let for_deal =
            repo.events_for_deal(&DealId("D-100".to_string())).await.expect("for deal");
        assert_eq!(for_deal, vec![event]);

        pool.close().await;
    }

    #[tokio::test]
    async fn due_returns_pending_and_backed_off_failures_but_never_dispatched() {
        let pool = setup_pool().await;
        let repo = SqlOutboxRepository::new(pool.clone());
        let now = parse_ts("2026-03-14T12:00:00Z");

        repo.save(sample_event("EVT-1", event_types::INVOICE_POSTED)).await.expect("save due");

        let mut failed = sample_event("EVT-2", event_types::PAYMENT_FAILED);
        failed.status = EventStatus::Failed;
        failed.attempts = 1;
        failed.last_error = Some("webhook 503".to_string());
        failed.next_run_at = now - Duration::seconds(10);
        repo.save(failed).await.expect("save failed");

        let mut dispatched = sample_event("EVT-3", event_types::DEAL_CLOSED_WON);
        dispatched.status = EventStatus::Dispatched;
        dispatched.attempts = 1;
        dispatched.next_run_at = now - Duration::minutes(5);
        repo.save(dispatched).await.expect("save dispatched");

        let mut future = sample_event("EVT-4", event_types::GUARDRAIL_VIOLATION);
        future.next_run_at = now + Duration::seconds(30);
        repo.save(future).await.expect("save future");

        let due = repo.due(now, 10).await.expect("due");
        let ids: Vec<&str> = due.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, vec!["EVT-2", "EVT-1"]);

        pool.close().await;
    }

    #[tokio::test]
    async fn due_respects_the_limit() {
        let pool = setup_pool().await;
        let repo = SqlOutboxRepository::new(pool.clone());
        let now = parse_ts("2026-03-14T12:00:00Z");

        for index in 0..5i64 {
            let mut event = sample_event(&format!("EVT-{index}"), event_types::INVOICE_POSTED);
            event.next_run_at = now - Duration::seconds(60 - index);
            repo.save(event).await.expect("save");
        }

        let due = repo.due(now, 2).await.expect("due");
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, "EVT-0");
        assert_eq!(due[1].id, "EVT-1");

        pool.close().await;
    }

    #[tokio::test]
    async fn upsert_marks_an_event_dispatched() {
        let pool = setup_pool().await;
        let repo = SqlOutboxRepository::new(pool.clone());
        let now = parse_ts("2026-03-14T12:00:00Z");

        let mut event = sample_event("EVT-1", event_types::APPROVAL_ESCALATED);
        repo.save(event.clone()).await.expect("save");

        event.status = EventStatus::Dispatched;
        event.attempts = 1;
        event.updated_at = now + Duration::seconds(1);
        repo.save(event.clone()).await.expect("upsert");

        assert!(repo.due(now + Duration::minutes(1), 10).await.expect("due").is_empty());
        let for_deal =
            repo.events_for_deal(&DealId("D-100".to_string())).await.expect("for deal");
        assert_eq!(for_deal, vec![event]);

        pool.close().await;
    }
}
