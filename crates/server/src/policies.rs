//! Policy lifecycle, versioning, conflict scan, and simulation routes.
//!
//! Endpoints:
//! - `POST /api/policies`                        — create a draft policy (version 1)
//! - `GET  /api/policies?type=&scope=`           — list active policies, filtered
//! - `POST /api/policies/{policy_id}/activate`   — activate, superseding the incumbent
//! - `POST /api/policies/{policy_id}/deactivate` — take an active policy out of rotation
//! - `POST /api/policies/rollback`               — new draft version from an older one
//! - `GET  /api/policies/conflicts`              — recorded advisory conflicts
//! - `POST /api/policies/conflicts/detect`       — run the pairwise scan now
//! - `POST /api/policies/simulate`               — what-if a proposed policy, stateless

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use dealgate_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use dealgate_core::config::GuardrailConfig;
use dealgate_core::domain::policy::{
    Policy, PolicyChangeRecord, PolicyChangeType, PolicyConfiguration, PolicyConflict, PolicyId,
    PolicyScope, PolicyStatus, PolicyType,
};
use dealgate_core::errors::DomainError;
use dealgate_core::guardrails::PolicySnapshot;
use dealgate_core::policy_store::{self, validate_configuration, PolicyStoreError};
use dealgate_core::simulation::{SimulationDeal, SimulationEngine, SimulationReport};
use dealgate_db::repositories::{PolicyRepository, RepositoryError, SqlPolicyRepository};
use dealgate_db::DbPool;

use crate::api::{self, ErrorReply};

#[derive(Clone)]
pub struct PoliciesState {
    db_pool: DbPool,
    limits: GuardrailConfig,
}

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub configuration: PolicyConfiguration,
    #[serde(default)]
    pub priority: i32,
    pub scope: PolicyScope,
    #[serde(default)]
    pub effective_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

#[derive(Debug, Deserialize)]
pub struct LifecycleRequest {
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub lineage_id: String,
    pub version: u32,
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    pub policy: Policy,
    pub test_deals: Vec<SimulationDeal>,
}

#[derive(Debug, Deserialize)]
pub struct ListPoliciesQuery {
    #[serde(rename = "type")]
    pub policy_type: Option<String>,
    pub scope: Option<String>,
}

pub fn router(db_pool: DbPool, limits: GuardrailConfig) -> Router {
    Router::new()
        .route("/api/policies", post(create_policy).get(list_policies))
        .route("/api/policies/rollback", post(rollback_policy))
        .route("/api/policies/conflicts", get(list_conflicts))
        .route("/api/policies/conflicts/detect", post(detect_conflicts_now))
        .route("/api/policies/simulate", post(simulate_policy))
        .route("/api/policies/{policy_id}/activate", post(activate_policy))
        .route("/api/policies/{policy_id}/deactivate", post(deactivate_policy))
        .with_state(PoliciesState { db_pool, limits })
}

fn change_record(
    policy_id: &PolicyId,
    change_type: PolicyChangeType,
    summary: String,
    old_configuration: Option<&PolicyConfiguration>,
    new_configuration: Option<&PolicyConfiguration>,
    actor: &str,
    now: DateTime<Utc>,
) -> PolicyChangeRecord {
    PolicyChangeRecord {
        id: Uuid::new_v4().to_string(),
        policy_id: policy_id.clone(),
        change_type,
        summary,
        old_configuration: old_configuration.and_then(|value| serde_json::to_value(value).ok()),
        new_configuration: new_configuration.and_then(|value| serde_json::to_value(value).ok()),
        changed_by: actor.to_string(),
        occurred_at: now,
    }
}

/// Pairwise conflict scan over the currently active set; findings are stored
/// so `GET /api/policies/conflicts` can replay them later. Advisory only.
async fn scan_conflicts(
    repository: &SqlPolicyRepository,
    now: DateTime<Utc>,
) -> Result<Vec<PolicyConflict>, RepositoryError> {
    let active: Vec<Policy> = repository
        .active_policies()
        .await?
        .into_iter()
        .filter(|policy| policy.is_active_at(now))
        .collect();

    let found = policy_store::detect_conflicts(&active, now);
    for conflict in &found {
        repository.record_conflict(conflict.clone()).await?;
    }
    Ok(found)
}

/// `POST /api/policies`
///
/// Validates the typed configuration before anything touches the database;
/// an invalid configuration persists nothing. The new policy starts its own
/// lineage as a version-1 draft.
async fn create_policy(
    State(state): State<PoliciesState>,
    Json(request): Json<CreatePolicyRequest>,
) -> Result<Json<Policy>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    validate_configuration(&request.configuration)
        .map_err(|error| api::error_reply(DomainError::from(error).into(), &correlation_id))?;

    let id = Uuid::new_v4().to_string();
    let policy = Policy {
        id: PolicyId(id.clone()),
        lineage_id: PolicyId(id),
        name: request.name,
        description: request.description,
        policy_type: request.configuration.policy_type(),
        status: PolicyStatus::Draft,
        version: 1,
        configuration: request.configuration,
        priority: request.priority,
        scope: request.scope,
        effective_at: request.effective_at,
        expires_at: request.expires_at,
        parent_policy_id: None,
        activated_at: None,
        created_by: request.created_by,
        created_at: now,
        updated_at: now,
    };

    let repository = SqlPolicyRepository::new(state.db_pool.clone());
    repository
        .save(policy.clone())
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;
    repository
        .append_change(change_record(
            &policy.id,
            PolicyChangeType::Created,
            format!("Created policy '{}'", policy.name),
            None,
            Some(&policy.configuration),
            &policy.created_by,
            now,
        ))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    api::record_audit(
        &state.db_pool,
        AuditEvent::new(
            None,
            &correlation_id,
            "policy.created",
            AuditCategory::Policy,
            &policy.created_by,
            AuditOutcome::Success,
        )
        .with_metadata("policy_id", policy.id.0.clone())
        .with_metadata("policy_type", policy.policy_type.as_str()),
    )
    .await;

    info!(
        event_name = "api.policies.created",
        correlation_id = %correlation_id,
        policy_id = %policy.id,
        policy_type = policy.policy_type.as_str(),
        scope = policy.scope.as_key(),
        "draft policy created"
    );

    Ok(Json(policy))
}

/// `GET /api/policies`
///
/// Lists active policies inside their effective window. `type` and `scope`
/// narrow the result; an unknown value in either is a client error rather
/// than an empty list.
async fn list_policies(
    State(state): State<PoliciesState>,
    Query(query): Query<ListPoliciesQuery>,
) -> Result<Json<Vec<Policy>>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let type_filter = match query.policy_type.as_deref() {
        Some(raw) => Some(PolicyType::parse(raw).ok_or_else(|| {
            api::bad_request(format!("unknown policy type `{raw}`"), &correlation_id)
        })?),
        None => None,
    };
    let scope_filter = match query.scope.as_deref() {
        Some(raw) => Some(PolicyScope::parse_key(raw).ok_or_else(|| {
            api::bad_request(format!("unknown policy scope `{raw}`"), &correlation_id)
        })?),
        None => None,
    };

    let policies: Vec<Policy> = SqlPolicyRepository::new(state.db_pool.clone())
        .active_policies()
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .into_iter()
        .filter(|policy| policy.is_active_at(now))
        .filter(|policy| type_filter.map_or(true, |wanted| policy.policy_type == wanted))
        .filter(|policy| scope_filter.as_ref().map_or(true, |wanted| &policy.scope == wanted))
        .collect();

    Ok(Json(policies))
}

/// `POST /api/policies/{policy_id}/activate`
///
/// Only a draft or inactive policy at the head of its lineage may activate.
/// The repository swap supersedes the active incumbent of the same
/// (type, scope) in one transaction, so two racing activations produce one
/// winner and one conflict error.
async fn activate_policy(
    Path(policy_id): Path<String>,
    State(state): State<PoliciesState>,
    Json(request): Json<LifecycleRequest>,
) -> Result<Json<Policy>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let repository = SqlPolicyRepository::new(state.db_pool.clone());
    let mut policy = repository
        .find_by_id(&PolicyId(policy_id.clone()))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .ok_or_else(|| api::not_found("policy", &policy_id, &correlation_id))?;

    match policy.status {
        PolicyStatus::Draft | PolicyStatus::Inactive => {}
        PolicyStatus::Active => {
            let error = PolicyStoreError::ActivationConflict {
                id: policy_id,
                exclusivity_key: policy.exclusivity_key(),
            };
            return Err(api::error_reply(DomainError::from(error).into(), &correlation_id));
        }
        PolicyStatus::Archived | PolicyStatus::Superseded => {
            let error = PolicyStoreError::NotActivatable {
                id: policy_id,
                status: policy.status.as_str().to_string(),
            };
            return Err(api::error_reply(DomainError::from(error).into(), &correlation_id));
        }
    }

    let versions = repository
        .versions_of(&policy.lineage_id)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;
    let latest = versions.iter().map(|version| version.version).max().unwrap_or(policy.version);
    if policy.version != latest {
        let error = PolicyStoreError::StaleVersion {
            id: policy.id.0.clone(),
            lineage_id: policy.lineage_id.0.clone(),
            version: policy.version,
            latest,
        };
        return Err(api::error_reply(DomainError::from(error).into(), &correlation_id));
    }

    let superseded = repository
        .activate_exclusive(&policy, now)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;
    policy.status = PolicyStatus::Active;
    policy.activated_at = Some(now);
    policy.updated_at = now;

    for superseded_id in &superseded {
        let name = repository
            .find_by_id(superseded_id)
            .await
            .map_err(|error| api::db_error(error, &correlation_id))?
            .map(|old| old.name)
            .unwrap_or_else(|| superseded_id.0.clone());
        repository
            .append_change(change_record(
                superseded_id,
                PolicyChangeType::Superseded,
                format!("Policy '{}' superseded by '{}'", name, policy.name),
                None,
                None,
                &request.actor,
                now,
            ))
            .await
            .map_err(|error| api::db_error(error, &correlation_id))?;
    }
    repository
        .append_change(change_record(
            &policy.id,
            PolicyChangeType::Activated,
            format!("Activated policy '{}'", policy.name),
            None,
            None,
            &request.actor,
            now,
        ))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    // The scan never blocks an activation that already committed.
    match scan_conflicts(&repository, now).await {
        Ok(found) if !found.is_empty() => {
            info!(
                event_name = "api.policies.conflicts_found",
                correlation_id = %correlation_id,
                found = found.len(),
                "activation left advisory conflicts"
            );
        }
        Ok(_) => {}
        Err(error) => {
            warn!(
                error = %error,
                correlation_id = %correlation_id,
                "conflict scan after activation failed"
            );
        }
    }

    api::record_audit(
        &state.db_pool,
        AuditEvent::new(
            None,
            &correlation_id,
            "policy.activated",
            AuditCategory::Policy,
            &request.actor,
            AuditOutcome::Success,
        )
        .with_metadata("policy_id", policy.id.0.clone())
        .with_metadata("version", policy.version.to_string())
        .with_metadata("superseded", superseded.len().to_string()),
    )
    .await;

    info!(
        event_name = "api.policies.activated",
        correlation_id = %correlation_id,
        policy_id = %policy.id,
        version = policy.version,
        superseded = superseded.len(),
        "policy activated"
    );

    Ok(Json(policy))
}

/// `POST /api/policies/{policy_id}/deactivate`
async fn deactivate_policy(
    Path(policy_id): Path<String>,
    State(state): State<PoliciesState>,
    Json(request): Json<LifecycleRequest>,
) -> Result<Json<Policy>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let repository = SqlPolicyRepository::new(state.db_pool.clone());
    let mut policy = repository
        .find_by_id(&PolicyId(policy_id.clone()))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .ok_or_else(|| api::not_found("policy", &policy_id, &correlation_id))?;

    if policy.status != PolicyStatus::Active {
        let error = PolicyStoreError::NotActivatable {
            id: policy_id,
            status: policy.status.as_str().to_string(),
        };
        return Err(api::error_reply(DomainError::from(error).into(), &correlation_id));
    }

    policy.status = PolicyStatus::Inactive;
    policy.updated_at = now;
    repository
        .save(policy.clone())
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;
    repository
        .append_change(change_record(
            &policy.id,
            PolicyChangeType::Deactivated,
            format!("Deactivated policy '{}'", policy.name),
            None,
            None,
            &request.actor,
            now,
        ))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    api::record_audit(
        &state.db_pool,
        AuditEvent::new(
            None,
            &correlation_id,
            "policy.deactivated",
            AuditCategory::Policy,
            &request.actor,
            AuditOutcome::Success,
        )
        .with_metadata("policy_id", policy.id.0.clone()),
    )
    .await;

    info!(
        event_name = "api.policies.deactivated",
        correlation_id = %correlation_id,
        policy_id = %policy.id,
        "policy deactivated"
    );

    Ok(Json(policy))
}

/// `POST /api/policies/rollback`
///
/// History stays immutable: rolling back mints a new draft version carrying
/// the old configuration instead of rewriting the old row. Activating the
/// draft is a separate call.
async fn rollback_policy(
    State(state): State<PoliciesState>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<Policy>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let repository = SqlPolicyRepository::new(state.db_pool.clone());
    let versions = repository
        .versions_of(&PolicyId(request.lineage_id.clone()))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;
    let Some(latest) = versions.last().cloned() else {
        return Err(api::not_found("policy lineage", &request.lineage_id, &correlation_id));
    };
    let target = versions
        .iter()
        .find(|version| version.version == request.version)
        .cloned()
        .ok_or_else(|| {
            let error = PolicyStoreError::UnknownVersion {
                lineage_id: request.lineage_id.clone(),
                version: request.version,
            };
            api::error_reply(DomainError::from(error).into(), &correlation_id)
        })?;

    let restored = Policy {
        id: PolicyId(Uuid::new_v4().to_string()),
        lineage_id: PolicyId(request.lineage_id.clone()),
        name: target.name.clone(),
        description: target.description.clone(),
        policy_type: target.policy_type,
        status: PolicyStatus::Draft,
        version: latest.version + 1,
        configuration: target.configuration.clone(),
        priority: target.priority,
        scope: target.scope.clone(),
        effective_at: target.effective_at,
        expires_at: target.expires_at,
        parent_policy_id: Some(target.id.clone()),
        activated_at: None,
        created_by: request.actor.clone(),
        created_at: now,
        updated_at: now,
    };

    repository
        .save(restored.clone())
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;
    repository
        .append_change(change_record(
            &restored.id,
            PolicyChangeType::RolledBack,
            format!("Rolled back policy '{}' to version {}", restored.name, request.version),
            Some(&latest.configuration),
            Some(&restored.configuration),
            &request.actor,
            now,
        ))
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    api::record_audit(
        &state.db_pool,
        AuditEvent::new(
            None,
            &correlation_id,
            "policy.rolled_back",
            AuditCategory::Policy,
            &request.actor,
            AuditOutcome::Success,
        )
        .with_metadata("policy_id", restored.id.0.clone())
        .with_metadata("lineage_id", request.lineage_id.clone())
        .with_metadata("restored_version", request.version.to_string()),
    )
    .await;

    info!(
        event_name = "api.policies.rolled_back",
        correlation_id = %correlation_id,
        policy_id = %restored.id,
        lineage_id = %restored.lineage_id,
        restored_version = request.version,
        new_version = restored.version,
        "policy rolled back into a new draft"
    );

    Ok(Json(restored))
}

/// `GET /api/policies/conflicts`
async fn list_conflicts(
    State(state): State<PoliciesState>,
) -> Result<Json<Vec<PolicyConflict>>, ErrorReply> {
    let correlation_id = api::correlation_id();

    let conflicts = SqlPolicyRepository::new(state.db_pool.clone())
        .conflicts()
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    Ok(Json(conflicts))
}

/// `POST /api/policies/conflicts/detect`
async fn detect_conflicts_now(
    State(state): State<PoliciesState>,
) -> Result<Json<Vec<PolicyConflict>>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    let repository = SqlPolicyRepository::new(state.db_pool.clone());
    let found = scan_conflicts(&repository, now)
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?;

    api::record_audit(
        &state.db_pool,
        AuditEvent::new(
            None,
            &correlation_id,
            "policy.conflict_scan",
            AuditCategory::Policy,
            "policy-store",
            AuditOutcome::Success,
        )
        .with_metadata("found", found.len().to_string()),
    )
    .await;

    info!(
        event_name = "api.policies.conflict_scan",
        correlation_id = %correlation_id,
        found = found.len(),
        "on-demand conflict scan"
    );

    Ok(Json(found))
}

/// `POST /api/policies/simulate`
///
/// Runs the proposed policy against what-if deals on top of the live active
/// snapshot. Nothing is persisted and no audit row is written; the report is
/// the whole product.
async fn simulate_policy(
    State(state): State<PoliciesState>,
    Json(request): Json<SimulateRequest>,
) -> Result<Json<SimulationReport>, ErrorReply> {
    let correlation_id = api::correlation_id();
    let now = Utc::now();

    validate_configuration(&request.policy.configuration)
        .map_err(|error| api::error_reply(DomainError::from(error).into(), &correlation_id))?;
    if request.test_deals.is_empty() {
        return Err(api::bad_request("test_deals must not be empty", &correlation_id));
    }
    for (index, deal) in request.test_deals.iter().enumerate() {
        deal.terms.validate().map_err(|error| {
            let label = deal.id.clone().unwrap_or_else(|| format!("#{index}"));
            api::bad_request(
                format!("test deal {label} has invalid terms: {error}"),
                &correlation_id,
            )
        })?;
    }

    let active: Vec<Policy> = SqlPolicyRepository::new(state.db_pool.clone())
        .active_policies()
        .await
        .map_err(|error| api::db_error(error, &correlation_id))?
        .into_iter()
        .filter(|policy| policy.is_active_at(now))
        .collect();
    let snapshot = PolicySnapshot::new(active, now);

    let report = SimulationEngine::new(state.limits.clone()).simulate(
        &request.policy,
        &request.test_deals,
        &snapshot,
        now,
    );

    info!(
        event_name = "api.policies.simulated",
        correlation_id = %correlation_id,
        deals = report.summary.total_deals,
        passed = report.summary.passed_deals,
        violations = report.summary.total_violations,
        "policy simulation"
    );

    Ok(Json(report))
}
