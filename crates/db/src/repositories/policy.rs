use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use dealgate_core::domain::policy::{
    ConflictSeverity, ConflictType, Policy, PolicyChangeRecord, PolicyChangeType, PolicyConflict,
    PolicyId, PolicyScope, PolicyStatus, PolicyType,
};

use super::decode::{parse_optional_timestamp, parse_timestamp, parse_u32};
use super::{PolicyRepository, RepositoryError};
use crate::DbPool;

pub struct SqlPolicyRepository {
    pool: DbPool,
}

impl SqlPolicyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const POLICY_COLUMNS: &str = "id, lineage_id, name, description, policy_type, status, version,
    configuration_json, priority, scope_key, effective_at, expires_at, parent_policy_id,
    activated_at, created_by, created_at, updated_at";

fn row_to_policy(row: SqliteRow) -> Result<Policy, RepositoryError> {
    let type_raw = row.try_get::<String, _>("policy_type")?;
    let policy_type = PolicyType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown policy type `{type_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = PolicyStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown policy status `{status_raw}`")))?;

    let scope_raw = row.try_get::<String, _>("scope_key")?;
    let scope = PolicyScope::parse_key(&scope_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown policy scope `{scope_raw}`")))?;

    let configuration_raw = row.try_get::<String, _>("configuration_json")?;
    let configuration = serde_json::from_str(&configuration_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid policy configuration: {error}"))
    })?;

    Ok(Policy {
        id: PolicyId(row.try_get("id")?),
        lineage_id: PolicyId(row.try_get("lineage_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        policy_type,
        status,
        version: parse_u32("version", row.try_get("version")?)?,
        configuration,
        priority: i32::try_from(row.try_get::<i64, _>("priority")?)
            .map_err(|_| RepositoryError::Decode("priority exceeds i32".to_string()))?,
        scope,
        effective_at: parse_optional_timestamp("effective_at", row.try_get("effective_at")?)?,
        expires_at: parse_optional_timestamp("expires_at", row.try_get("expires_at")?)?,
        parent_policy_id: row.try_get::<Option<String>, _>("parent_policy_id")?.map(PolicyId),
        activated_at: parse_optional_timestamp("activated_at", row.try_get("activated_at")?)?,
        created_by: row.try_get("created_by")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn row_to_conflict(row: SqliteRow) -> Result<PolicyConflict, RepositoryError> {
    let type_raw = row.try_get::<String, _>("conflict_type")?;
    let conflict_type = ConflictType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown conflict type `{type_raw}`")))?;

    let severity_raw = row.try_get::<String, _>("severity")?;
    let severity = ConflictSeverity::parse(&severity_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown conflict severity `{severity_raw}`"))
    })?;

    Ok(PolicyConflict {
        id: row.try_get("id")?,
        first_policy_id: PolicyId(row.try_get("first_policy_id")?),
        second_policy_id: PolicyId(row.try_get("second_policy_id")?),
        conflict_type,
        severity,
        description: row.try_get("description")?,
        resolution_suggestion: row.try_get("resolution_suggestion")?,
        detected_at: parse_timestamp("detected_at", row.try_get("detected_at")?)?,
        resolved_at: parse_optional_timestamp("resolved_at", row.try_get("resolved_at")?)?,
    })
}

fn row_to_change(row: SqliteRow) -> Result<PolicyChangeRecord, RepositoryError> {
    let change_raw = row.try_get::<String, _>("change_type")?;
    let change_type = PolicyChangeType::parse(&change_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown change type `{change_raw}`")))?;

    let old_configuration = row
        .try_get::<Option<String>, _>("old_configuration_json")?
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|error| {
                RepositoryError::Decode(format!("invalid old configuration: {error}"))
            })
        })
        .transpose()?;
    let new_configuration = row
        .try_get::<Option<String>, _>("new_configuration_json")?
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|error| {
                RepositoryError::Decode(format!("invalid new configuration: {error}"))
            })
        })
        .transpose()?;

    Ok(PolicyChangeRecord {
        id: row.try_get("id")?,
        policy_id: PolicyId(row.try_get("policy_id")?),
        change_type,
        summary: row.try_get("summary")?,
        old_configuration,
        new_configuration,
        changed_by: row.try_get("changed_by")?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

#[async_trait::async_trait]
impl PolicyRepository for SqlPolicyRepository {
    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<Policy>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {POLICY_COLUMNS} FROM policies WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_policy).transpose()
    }

    async fn list(&self, status: Option<PolicyStatus>) -> Result<Vec<Policy>, RepositoryError> {
        let rows = if let Some(status) = status {
            sqlx::query(&format!(
                "SELECT {POLICY_COLUMNS} FROM policies
                 WHERE status = ?
                 ORDER BY created_at ASC, id ASC"
            ))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {POLICY_COLUMNS} FROM policies ORDER BY created_at ASC, id ASC"
            ))
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(row_to_policy).collect()
    }

    async fn versions_of(&self, lineage_id: &PolicyId) -> Result<Vec<Policy>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM policies WHERE lineage_id = ? ORDER BY version ASC"
        ))
        .bind(&lineage_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_policy).collect()
    }

    async fn active_policies(&self) -> Result<Vec<Policy>, RepositoryError> {
        self.list(Some(PolicyStatus::Active)).await
    }

    async fn save(&self, policy: Policy) -> Result<(), RepositoryError> {
        let configuration_json = serde_json::to_string(&policy.configuration).map_err(|error| {
            RepositoryError::Decode(format!("failed to encode policy configuration: {error}"))
        })?;

        sqlx::query(
            "INSERT INTO policies (
                id, lineage_id, name, description, policy_type, status, version,
                configuration_json, priority, scope_key, effective_at, expires_at,
                parent_policy_id, activated_at, created_by, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                status = excluded.status,
                configuration_json = excluded.configuration_json,
                priority = excluded.priority,
                scope_key = excluded.scope_key,
                effective_at = excluded.effective_at,
                expires_at = excluded.expires_at,
                activated_at = excluded.activated_at,
                updated_at = excluded.updated_at",
        )
        .bind(&policy.id.0)
        .bind(&policy.lineage_id.0)
        .bind(&policy.name)
        .bind(policy.description.as_deref())
        .bind(policy.policy_type.as_str())
        .bind(policy.status.as_str())
        .bind(i64::from(policy.version))
        .bind(configuration_json)
        .bind(i64::from(policy.priority))
        .bind(policy.scope.as_key())
        .bind(policy.effective_at.map(|value| value.to_rfc3339()))
        .bind(policy.expires_at.map(|value| value.to_rfc3339()))
        .bind(policy.parent_policy_id.as_ref().map(|id| id.0.as_str()))
        .bind(policy.activated_at.map(|value| value.to_rfc3339()))
        .bind(&policy.created_by)
        .bind(policy.created_at.to_rfc3339())
        .bind(policy.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn activate_exclusive(
        &self,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Result<Vec<PolicyId>, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let superseded: Vec<PolicyId> = sqlx::query(
            "SELECT id FROM policies
             WHERE policy_type = ? AND scope_key = ? AND status = 'active' AND id != ?",
        )
        .bind(policy.policy_type.as_str())
        .bind(policy.scope.as_key())
        .bind(&policy.id.0)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| Ok(PolicyId(row.try_get::<String, _>("id")?)))
        .collect::<Result<_, sqlx::Error>>()?;

        // Supersede before activating so the active-exclusivity index never
        // sees two active rows for the same (type, scope).
        sqlx::query(
            "UPDATE policies SET status = 'superseded', updated_at = ?
             WHERE policy_type = ? AND scope_key = ? AND status = 'active' AND id != ?",
        )
        .bind(now.to_rfc3339())
        .bind(policy.policy_type.as_str())
        .bind(policy.scope.as_key())
        .bind(&policy.id.0)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE policies SET status = 'active', activated_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&policy.id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(superseded)
    }

    async fn record_conflict(&self, conflict: PolicyConflict) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO policy_conflicts (
                id, first_policy_id, second_policy_id, conflict_type, severity,
                description, resolution_suggestion, detected_at, resolved_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                severity = excluded.severity,
                description = excluded.description,
                resolution_suggestion = excluded.resolution_suggestion,
                resolved_at = excluded.resolved_at",
        )
        .bind(&conflict.id)
        .bind(&conflict.first_policy_id.0)
        .bind(&conflict.second_policy_id.0)
        .bind(conflict.conflict_type.as_str())
        .bind(conflict.severity.as_str())
        .bind(&conflict.description)
        .bind(conflict.resolution_suggestion.as_deref())
        .bind(conflict.detected_at.to_rfc3339())
        .bind(conflict.resolved_at.map(|value| value.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn conflicts(&self) -> Result<Vec<PolicyConflict>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, first_policy_id, second_policy_id, conflict_type, severity,
                    description, resolution_suggestion, detected_at, resolved_at
             FROM policy_conflicts
             ORDER BY detected_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_conflict).collect()
    }

    async fn conflicts_for(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<PolicyConflict>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, first_policy_id, second_policy_id, conflict_type, severity,
                    description, resolution_suggestion, detected_at, resolved_at
             FROM policy_conflicts
             WHERE first_policy_id = ? OR second_policy_id = ?
             ORDER BY detected_at ASC",
        )
        .bind(&policy_id.0)
        .bind(&policy_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_conflict).collect()
    }

    async fn append_change(&self, record: PolicyChangeRecord) -> Result<(), RepositoryError> {
        let old_json = record
            .old_configuration
            .as_ref()
            .map(|value| serde_json::to_string(value))
            .transpose()
            .map_err(|error| {
                RepositoryError::Decode(format!("failed to encode old configuration: {error}"))
            })?;
        let new_json = record
            .new_configuration
            .as_ref()
            .map(|value| serde_json::to_string(value))
            .transpose()
            .map_err(|error| {
                RepositoryError::Decode(format!("failed to encode new configuration: {error}"))
            })?;

        sqlx::query(
            "INSERT INTO policy_change_log (
                id, policy_id, change_type, summary, old_configuration_json,
                new_configuration_json, changed_by, occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.policy_id.0)
        .bind(record.change_type.as_str())
        .bind(&record.summary)
        .bind(old_json)
        .bind(new_json)
        .bind(&record.changed_by)
        .bind(record.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn changes_for(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<PolicyChangeRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, policy_id, change_type, summary, old_configuration_json,
                    new_configuration_json, changed_by, occurred_at
             FROM policy_change_log
             WHERE policy_id = ?
             ORDER BY occurred_at ASC, id ASC",
        )
        .bind(&policy_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_change).collect()
    }
}
