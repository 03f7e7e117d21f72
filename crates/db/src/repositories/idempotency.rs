//! Sqlite-backed idempotency guard. The first `begin` for a key wins the
//! row insert; later callers decide against the stored row and, when the
//! lease is stale, take it over with an update guarded by the row's
//! attempt count. Ledger rows are never deleted.

use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use thiserror::Error;

use dealgate_core::domain::idempotency::{IdempotencyRecord, OperationState};
use dealgate_core::idempotency_guard::{assess_begin, BeginDecision, BeginOutcome, GuardError};

use super::decode::{parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{IdempotencyRepository, RepositoryError};
use crate::DbPool;

#[derive(Debug, Error)]
pub enum GuardStoreError {
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct SqlIdempotencyRepository {
    pool: DbPool,
    lease_ttl: Duration,
}

const LEDGER_COLUMNS: &str = "operation_key, payload_fingerprint, state, attempt_count,
    lease_expires_at, result_snapshot_json, last_error, first_seen_at, last_seen_at,
    correlation_id";

fn row_to_record(row: SqliteRow) -> Result<IdempotencyRecord, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = OperationState::parse(&state_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown operation state `{state_raw}`"))
    })?;

    Ok(IdempotencyRecord {
        key: row.try_get("operation_key")?,
        payload_fingerprint: row.try_get("payload_fingerprint")?,
        state,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        lease_expires_at: parse_optional_timestamp(
            "lease_expires_at",
            row.try_get("lease_expires_at")?,
        )?,
        result_snapshot_json: row.try_get("result_snapshot_json")?,
        last_error: row.try_get("last_error")?,
        first_seen_at: parse_timestamp("first_seen_at", row.try_get("first_seen_at")?)?,
        last_seen_at: parse_timestamp("last_seen_at", row.try_get("last_seen_at")?)?,
        correlation_id: row.try_get("correlation_id")?,
    })
}

impl SqlIdempotencyRepository {
    pub fn new(pool: DbPool, lease_ttl: Duration) -> Self {
        Self { pool, lease_ttl }
    }

    pub async fn begin(
        &self,
        key: &str,
        fingerprint: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, GuardStoreError> {
        let inserted = sqlx::query(
            "INSERT INTO idempotency_ledger (
                operation_key, payload_fingerprint, state, attempt_count,
                lease_expires_at, first_seen_at, last_seen_at, correlation_id
             ) VALUES (?, ?, 'in_flight', 1, ?, ?, ?, ?)
             ON CONFLICT(operation_key) DO NOTHING",
        )
        .bind(key)
        .bind(fingerprint)
        .bind((now + self.lease_ttl).to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(correlation_id)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if inserted.rows_affected() == 1 {
            return Ok(BeginOutcome::Proceed { attempt: 1 });
        }

        let record = self.require_record(key).await?;
        match assess_begin(Some(&record), fingerprint, now) {
            BeginDecision::Mismatch => {
                Err(GuardError::FingerprintMismatch { key: key.to_string() }.into())
            }
            BeginDecision::Cached { result } => Ok(BeginOutcome::Cached { result }),
            BeginDecision::Busy { lease_expires_at } => {
                Ok(BeginOutcome::InProgress { lease_expires_at })
            }
            // Insert cannot come back for an existing row; both remaining
            // arms take the lease over with a guarded update.
            BeginDecision::Insert | BeginDecision::Steal { .. } => {
                self.steal_lease(&record, correlation_id, now).await
            }
        }
    }

    /// Records the terminal result and drops the lease. A key completes at
    /// most once.
    pub async fn complete(
        &self,
        key: &str,
        result_json: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GuardStoreError> {
        let updated = sqlx::query(
            "UPDATE idempotency_ledger
             SET state = 'completed', result_snapshot_json = ?, lease_expires_at = NULL,
                 last_seen_at = ?
             WHERE operation_key = ? AND state = 'in_flight'",
        )
        .bind(result_json)
        .bind(now.to_rfc3339())
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        match self.find_operation(key).await? {
            Some(record) if record.state == OperationState::Completed => {
                Err(GuardError::AlreadyCompleted { key: key.to_string() }.into())
            }
            _ => Err(GuardError::NotInFlight { key: key.to_string() }.into()),
        }
    }

    /// Abandons the lease after a failure so an immediate retry may proceed
    /// without waiting out the TTL.
    pub async fn release(
        &self,
        key: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GuardStoreError> {
        let updated = sqlx::query(
            "UPDATE idempotency_ledger
             SET lease_expires_at = ?, last_error = ?, last_seen_at = ?
             WHERE operation_key = ? AND state = 'in_flight'",
        )
        .bind(now.to_rfc3339())
        .bind(error)
        .bind(now.to_rfc3339())
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        match self.find_operation(key).await? {
            Some(record) if record.state == OperationState::Completed => {
                Err(GuardError::AlreadyCompleted { key: key.to_string() }.into())
            }
            _ => Err(GuardError::NotInFlight { key: key.to_string() }.into()),
        }
    }

    async fn steal_lease(
        &self,
        record: &IdempotencyRecord,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, GuardStoreError> {
        let attempt = record.attempt_count + 1;
        let claimed = sqlx::query(
            "UPDATE idempotency_ledger
             SET attempt_count = ?, lease_expires_at = ?, last_seen_at = ?, correlation_id = ?
             WHERE operation_key = ? AND state = 'in_flight' AND attempt_count = ?",
        )
        .bind(i64::from(attempt))
        .bind((now + self.lease_ttl).to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(correlation_id)
        .bind(&record.key)
        .bind(i64::from(record.attempt_count))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if claimed.rows_affected() == 1 {
            return Ok(BeginOutcome::Proceed { attempt });
        }

        // Lost the race: someone else stole the lease or completed the
        // operation since we read the row.
        let current = self.require_record(&record.key).await?;
        match current.state {
            OperationState::Completed => Ok(BeginOutcome::Cached {
                result: current.result_snapshot_json.unwrap_or_else(|| "null".to_string()),
            }),
            OperationState::InFlight => Ok(BeginOutcome::InProgress {
                lease_expires_at: current.lease_expires_at.unwrap_or(now),
            }),
        }
    }

    async fn require_record(&self, key: &str) -> Result<IdempotencyRecord, RepositoryError> {
        self.find_operation(key).await?.ok_or_else(|| {
            RepositoryError::Decode(format!("idempotency row for `{key}` disappeared"))
        })
    }
}

#[async_trait::async_trait]
impl IdempotencyRepository for SqlIdempotencyRepository {
    async fn find_operation(
        &self,
        operation_key: &str,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {LEDGER_COLUMNS} FROM idempotency_ledger WHERE operation_key = ?"
        ))
        .bind(operation_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_record).transpose()
    }

    async fn save_operation(&self, record: IdempotencyRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO idempotency_ledger (
                operation_key, payload_fingerprint, state, attempt_count,
                lease_expires_at, result_snapshot_json, last_error, first_seen_at,
                last_seen_at, correlation_id
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(operation_key) DO UPDATE SET
                state = excluded.state,
                attempt_count = excluded.attempt_count,
                lease_expires_at = excluded.lease_expires_at,
                result_snapshot_json = excluded.result_snapshot_json,
                last_error = excluded.last_error,
                last_seen_at = excluded.last_seen_at,
                correlation_id = excluded.correlation_id",
        )
        .bind(&record.key)
        .bind(&record.payload_fingerprint)
        .bind(record.state.as_str())
        .bind(i64::from(record.attempt_count))
        .bind(record.lease_expires_at.map(|value| value.to_rfc3339()))
        .bind(record.result_snapshot_json.as_deref())
        .bind(record.last_error.as_deref())
        .bind(record.first_seen_at.to_rfc3339())
        .bind(record.last_seen_at.to_rfc3339())
        .bind(record.correlation_id.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
