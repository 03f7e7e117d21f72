use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::policy::{
    ConflictSeverity, ConflictType, Policy, PolicyChangeRecord, PolicyChangeType,
    PolicyConfiguration, PolicyConflict, PolicyId, PolicyScope, PolicyStatus, PolicyType,
};
use crate::guardrails::PolicySnapshot;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyStoreError {
    #[error("policy configuration is invalid: {reasons}")]
    InvalidConfiguration { reasons: String },
    #[error("policy `{id}` was not found")]
    NotFound { id: String },
    #[error("lineage `{lineage_id}` has no version {version}")]
    UnknownVersion { lineage_id: String, version: u32 },
    #[error("policy `{id}` cannot transition from status `{status}`")]
    NotActivatable { id: String, status: String },
    #[error("policy `{id}` is version {version} but lineage `{lineage_id}` is at {latest}")]
    StaleVersion { id: String, lineage_id: String, version: u32, latest: u32 },
    #[error("policy `{id}` lost the activation race for `{exclusivity_key}`")]
    ActivationConflict { id: String, exclusivity_key: String },
}

/// Rejects a configuration whose values are out of range. Shape errors are
/// impossible here; the tagged union fixes them at deserialization.
pub fn validate_configuration(
    configuration: &PolicyConfiguration,
) -> Result<(), PolicyStoreError> {
    let reasons = configuration.validate();
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(PolicyStoreError::InvalidConfiguration { reasons: reasons.join("; ") })
    }
}

#[derive(Clone, Debug)]
pub struct PolicyDraft {
    pub name: String,
    pub description: Option<String>,
    pub configuration: PolicyConfiguration,
    pub priority: i32,
    pub scope: PolicyScope,
    pub effective_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

/// Pairwise conflict scan across active policies of the same type with
/// overlapping scopes. Advisory only; activation is never blocked.
pub fn detect_conflicts(active: &[Policy], now: DateTime<Utc>) -> Vec<PolicyConflict> {
    let mut conflicts = Vec::new();

    for (index, first) in active.iter().enumerate() {
        for second in active.iter().skip(index + 1) {
            if first.policy_type != second.policy_type
                || !scopes_overlap(&first.scope, &second.scope)
            {
                continue;
            }
            conflicts.extend(conflicts_between(first, second, now));
        }
    }

    conflicts
}

fn scopes_overlap(first: &PolicyScope, second: &PolicyScope) -> bool {
    first.is_wildcard() || second.is_wildcard() || first == second
}

fn conflicts_between(first: &Policy, second: &Policy, now: DateTime<Utc>) -> Vec<PolicyConflict> {
    let mut found = Vec::new();

    if first.priority == second.priority {
        found.push(PolicyConflict {
            id: Uuid::new_v4().to_string(),
            first_policy_id: first.id.clone(),
            second_policy_id: second.id.clone(),
            conflict_type: ConflictType::Overlap,
            severity: ConflictSeverity::Medium,
            description: format!(
                "Policies '{}' and '{}' have equal priority",
                first.name, second.name
            ),
            resolution_suggestion: Some(
                "Adjust policy priorities to establish clear precedence".to_string(),
            ),
            detected_at: now,
            resolved_at: None,
        });
    }

    if let (Some(first_ceiling), Some(second_ceiling)) =
        (default_discount_ceiling(&first.configuration), default_discount_ceiling(&second.configuration))
    {
        if first_ceiling != second_ceiling {
            found.push(PolicyConflict {
                id: Uuid::new_v4().to_string(),
                first_policy_id: first.id.clone(),
                second_policy_id: second.id.clone(),
                conflict_type: ConflictType::Contradiction,
                severity: ConflictSeverity::High,
                description: "Discount limits differ between policies".to_string(),
                resolution_suggestion: Some(
                    "Ensure discount limits are consistent across pricing policies".to_string(),
                ),
                detected_at: now,
                resolved_at: None,
            });
        }
    }

    found
}

fn default_discount_ceiling(configuration: &PolicyConfiguration) -> Option<rust_decimal::Decimal> {
    match configuration {
        PolicyConfiguration::Pricing(rules) => {
            Some(rules.discount_guardrails.default_max_discount_percent)
        }
        PolicyConfiguration::Discount(rules) => Some(rules.default_max_discount_percent),
        _ => None,
    }
}

/// Versioned policy storage with exclusive activation per (type, scope).
/// The reference implementation; the sqlite repository mirrors these
/// semantics transactionally.
#[derive(Default)]
pub struct InMemoryPolicyStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    policies: Vec<Policy>,
    change_log: Vec<PolicyChangeRecord>,
    conflicts: Vec<PolicyConflict>,
}

impl InMemoryPolicyStore {
    fn state(&self) -> MutexGuard<'_, StoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Validates and persists a new draft as version 1 of a fresh lineage.
    pub fn create(
        &self,
        draft: PolicyDraft,
        now: DateTime<Utc>,
    ) -> Result<Policy, PolicyStoreError> {
        validate_configuration(&draft.configuration)?;

        let id = Uuid::new_v4().to_string();
        let policy = Policy {
            id: PolicyId(id.clone()),
            lineage_id: PolicyId(id),
            name: draft.name,
            description: draft.description,
            policy_type: draft.configuration.policy_type(),
            status: PolicyStatus::Draft,
            version: 1,
            configuration: draft.configuration,
            priority: draft.priority,
            scope: draft.scope,
            effective_at: draft.effective_at,
            expires_at: draft.expires_at,
            parent_policy_id: None,
            activated_at: None,
            created_by: draft.created_by,
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state();
        state.change_log.push(change_record(
            &policy,
            PolicyChangeType::Created,
            format!("Created policy '{}'", policy.name),
            None,
            Some(&policy.configuration),
            &policy.created_by,
            now,
        ));
        state.policies.push(policy.clone());
        Ok(policy)
    }

    /// Appends a new draft version to an existing lineage. Prior versions are
    /// left untouched.
    pub fn new_version(
        &self,
        lineage_id: &str,
        draft: PolicyDraft,
        now: DateTime<Utc>,
    ) -> Result<Policy, PolicyStoreError> {
        validate_configuration(&draft.configuration)?;

        let mut state = self.state();
        let latest = latest_in_lineage(&state.policies, lineage_id)
            .ok_or_else(|| PolicyStoreError::NotFound { id: lineage_id.to_string() })?
            .clone();

        let policy = Policy {
            id: PolicyId(Uuid::new_v4().to_string()),
            lineage_id: PolicyId(lineage_id.to_string()),
            name: draft.name,
            description: draft.description,
            policy_type: draft.configuration.policy_type(),
            status: PolicyStatus::Draft,
            version: latest.version + 1,
            configuration: draft.configuration,
            priority: draft.priority,
            scope: draft.scope,
            effective_at: draft.effective_at,
            expires_at: draft.expires_at,
            parent_policy_id: Some(latest.id.clone()),
            activated_at: None,
            created_by: draft.created_by,
            created_at: now,
            updated_at: now,
        };

        state.change_log.push(change_record(
            &policy,
            PolicyChangeType::Updated,
            format!("Updated policy '{}'", policy.name),
            Some(&latest.configuration),
            Some(&policy.configuration),
            &policy.created_by,
            now,
        ));
        state.policies.push(policy.clone());
        Ok(policy)
    }

    /// Activates a draft or inactive policy, superseding the prior active
    /// version in the same (type, scope). The whole operation is one critical
    /// section, so concurrent activations produce exactly one winner.
    pub fn activate(
        &self,
        id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Policy, PolicyStoreError> {
        let mut state = self.state();

        let position = state
            .policies
            .iter()
            .position(|policy| policy.id.0 == id)
            .ok_or_else(|| PolicyStoreError::NotFound { id: id.to_string() })?;

        let candidate = state.policies[position].clone();
        match candidate.status {
            PolicyStatus::Draft | PolicyStatus::Inactive => {}
            PolicyStatus::Active => {
                return Err(PolicyStoreError::ActivationConflict {
                    id: id.to_string(),
                    exclusivity_key: candidate.exclusivity_key(),
                });
            }
            PolicyStatus::Archived | PolicyStatus::Superseded => {
                return Err(PolicyStoreError::NotActivatable {
                    id: id.to_string(),
                    status: candidate.status.as_str().to_string(),
                });
            }
        }

        let latest_version = latest_in_lineage(&state.policies, &candidate.lineage_id.0)
            .map(|policy| policy.version)
            .unwrap_or(candidate.version);
        if candidate.version != latest_version {
            return Err(PolicyStoreError::StaleVersion {
                id: id.to_string(),
                lineage_id: candidate.lineage_id.0.clone(),
                version: candidate.version,
                latest: latest_version,
            });
        }

        let exclusivity_key = candidate.exclusivity_key();
        let mut superseded_records = Vec::new();
        for policy in state.policies.iter_mut() {
            if policy.id != candidate.id
                && policy.status == PolicyStatus::Active
                && policy.exclusivity_key() == exclusivity_key
            {
                policy.status = PolicyStatus::Superseded;
                policy.updated_at = now;
                superseded_records.push(change_record(
                    policy,
                    PolicyChangeType::Superseded,
                    format!("Policy '{}' superseded by '{}'", policy.name, candidate.name),
                    None,
                    None,
                    actor,
                    now,
                ));
            }
        }
        state.change_log.extend(superseded_records);

        let activated = {
            let policy = &mut state.policies[position];
            policy.status = PolicyStatus::Active;
            policy.activated_at = Some(now);
            policy.updated_at = now;
            policy.clone()
        };

        state.change_log.push(change_record(
            &activated,
            PolicyChangeType::Activated,
            format!("Activated policy '{}'", activated.name),
            None,
            None,
            actor,
            now,
        ));

        let active: Vec<Policy> =
            state.policies.iter().filter(|policy| policy.is_active_at(now)).cloned().collect();
        let new_conflicts = detect_conflicts(&active, now);
        state.conflicts.extend(new_conflicts);

        Ok(activated)
    }

    pub fn deactivate(
        &self,
        id: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Policy, PolicyStoreError> {
        let mut state = self.state();

        let position = state
            .policies
            .iter()
            .position(|policy| policy.id.0 == id)
            .ok_or_else(|| PolicyStoreError::NotFound { id: id.to_string() })?;

        if state.policies[position].status != PolicyStatus::Active {
            return Err(PolicyStoreError::NotActivatable {
                id: id.to_string(),
                status: state.policies[position].status.as_str().to_string(),
            });
        }

        let deactivated = {
            let policy = &mut state.policies[position];
            policy.status = PolicyStatus::Inactive;
            policy.updated_at = now;
            policy.clone()
        };

        state.change_log.push(change_record(
            &deactivated,
            PolicyChangeType::Deactivated,
            format!("Deactivated policy '{}'", deactivated.name),
            None,
            None,
            actor,
            now,
        ));

        Ok(deactivated)
    }

    /// Creates a new draft version carrying the configuration of an earlier
    /// version. The historical row is never touched; activating the draft is
    /// a separate, explicit step.
    pub fn rollback(
        &self,
        lineage_id: &str,
        version: u32,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Policy, PolicyStoreError> {
        let mut state = self.state();

        let target = state
            .policies
            .iter()
            .find(|policy| policy.lineage_id.0 == lineage_id && policy.version == version)
            .cloned()
            .ok_or_else(|| PolicyStoreError::UnknownVersion {
                lineage_id: lineage_id.to_string(),
                version,
            })?;

        let latest = latest_in_lineage(&state.policies, lineage_id)
            .cloned()
            .ok_or_else(|| PolicyStoreError::NotFound { id: lineage_id.to_string() })?;

        let restored = Policy {
            id: PolicyId(Uuid::new_v4().to_string()),
            lineage_id: PolicyId(lineage_id.to_string()),
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
            created_by: actor.to_string(),
            created_at: now,
            updated_at: now,
        };

        state.change_log.push(change_record(
            &restored,
            PolicyChangeType::RolledBack,
            format!("Rolled back policy '{}' to version {}", restored.name, version),
            Some(&latest.configuration),
            Some(&restored.configuration),
            actor,
            now,
        ));
        state.policies.push(restored.clone());
        Ok(restored)
    }

    pub fn get(&self, id: &str) -> Option<Policy> {
        self.state().policies.iter().find(|policy| policy.id.0 == id).cloned()
    }

    pub fn list_active(
        &self,
        policy_type: Option<PolicyType>,
        scope: Option<&PolicyScope>,
        now: DateTime<Utc>,
    ) -> Vec<Policy> {
        self.state()
            .policies
            .iter()
            .filter(|policy| policy.is_active_at(now))
            .filter(|policy| policy_type.map(|wanted| policy.policy_type == wanted).unwrap_or(true))
            .filter(|policy| scope.map(|wanted| &policy.scope == wanted).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn versions(&self, lineage_id: &str) -> Vec<Policy> {
        let mut versions: Vec<Policy> = self
            .state()
            .policies
            .iter()
            .filter(|policy| policy.lineage_id.0 == lineage_id)
            .cloned()
            .collect();
        versions.sort_by_key(|policy| policy.version);
        versions
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> PolicySnapshot {
        let policies = self
            .state()
            .policies
            .iter()
            .filter(|policy| policy.is_active_at(now))
            .cloned()
            .collect();
        PolicySnapshot::new(policies, now)
    }

    /// Scans all currently active policies and records any new conflicts.
    pub fn scan_conflicts(&self, now: DateTime<Utc>) -> Vec<PolicyConflict> {
        let mut state = self.state();
        let active: Vec<Policy> =
            state.policies.iter().filter(|policy| policy.is_active_at(now)).cloned().collect();
        let found = detect_conflicts(&active, now);
        state.conflicts.extend(found.clone());
        found
    }

    pub fn conflicts(&self) -> Vec<PolicyConflict> {
        self.state().conflicts.clone()
    }

    pub fn change_log(&self, policy_id: &str) -> Vec<PolicyChangeRecord> {
        self.state()
            .change_log
            .iter()
            .filter(|record| record.policy_id.0 == policy_id)
            .cloned()
            .collect()
    }
}

fn latest_in_lineage<'a>(policies: &'a [Policy], lineage_id: &str) -> Option<&'a Policy> {
    policies
        .iter()
        .filter(|policy| policy.lineage_id.0 == lineage_id)
        .max_by_key(|policy| policy.version)
}

#[allow(clippy::too_many_arguments)]
fn change_record(
    policy: &Policy,
    change_type: PolicyChangeType,
    summary: String,
    old_configuration: Option<&PolicyConfiguration>,
    new_configuration: Option<&PolicyConfiguration>,
    actor: &str,
    now: DateTime<Utc>,
) -> PolicyChangeRecord {
    PolicyChangeRecord {
        id: Uuid::new_v4().to_string(),
        policy_id: policy.id.clone(),
        change_type,
        summary,
        old_configuration: old_configuration.and_then(|value| serde_json::to_value(value).ok()),
        new_configuration: new_configuration.and_then(|value| serde_json::to_value(value).ok()),
        changed_by: actor.to_string(),
        occurred_at: now,
    }
}
