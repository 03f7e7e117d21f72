use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::idempotency::{IdempotencyRecord, OperationState};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("idempotency key `{key}` was already used with a different payload")]
    FingerprintMismatch { key: String },
    #[error("operation `{key}` already completed; results are immutable")]
    AlreadyCompleted { key: String },
    #[error("operation `{key}` has no in-flight lease")]
    NotInFlight { key: String },
}

/// What the caller should do after `begin`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Lease acquired; execute the operation, then `complete` or `release`.
    Proceed { attempt: u32 },
    /// The operation already ran; the stored result is returned verbatim.
    Cached { result: String },
    /// Another holder owns a live lease; retry after it expires.
    InProgress { lease_expires_at: DateTime<Utc> },
}

/// Storage-independent verdict on an incoming `begin`. The in-memory guard
/// and the sqlite-backed guard both apply this under their own per-key
/// serialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeginDecision {
    Insert,
    Steal { attempt: u32 },
    Cached { result: String },
    Busy { lease_expires_at: DateTime<Utc> },
    Mismatch,
}

pub fn assess_begin(
    existing: Option<&IdempotencyRecord>,
    fingerprint: &str,
    now: DateTime<Utc>,
) -> BeginDecision {
    let Some(record) = existing else {
        return BeginDecision::Insert;
    };

    if record.payload_fingerprint != fingerprint {
        return BeginDecision::Mismatch;
    }

    match record.state {
        OperationState::Completed => BeginDecision::Cached {
            result: record.result_snapshot_json.clone().unwrap_or_else(|| "null".to_string()),
        },
        OperationState::InFlight => {
            if record.lease_expired(now) {
                BeginDecision::Steal { attempt: record.attempt_count + 1 }
            } else {
                match record.lease_expires_at {
                    Some(lease_expires_at) => BeginDecision::Busy { lease_expires_at },
                    // In-flight with no lease only happens after a release,
                    // which invites the next caller in.
                    None => BeginDecision::Steal { attempt: record.attempt_count + 1 },
                }
            }
        }
    }
}

/// Deterministic operation key for deal-triggered work: sha-256 over
/// `<deal_id>:<trigger_event_id>`, full hex.
pub fn derive_operation_key(deal_id: &str, trigger_event_id: &str) -> String {
    sha256_hex(format!("{deal_id}:{trigger_event_id}").as_bytes())
}

/// Content fingerprint of a request payload. Two calls with the same key must
/// carry the same fingerprint to be treated as retries of one operation.
pub fn fingerprint_payload(payload: &serde_json::Value) -> String {
    let canonical = match serde_json::to_vec(payload) {
        Ok(bytes) => bytes,
        Err(_) => payload.to_string().into_bytes(),
    };
    blake3::hash(&canonical).to_hex().to_string()
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Single-process ledger of every guarded operation. One critical section
/// per call keeps lease stealing to exactly one winner.
pub struct InMemoryIdempotencyGuard {
    lease_ttl: Duration,
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyGuard {
    pub fn new(lease_ttl: Duration) -> Self {
        Self { lease_ttl, records: Mutex::new(HashMap::new()) }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, IdempotencyRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn begin(
        &self,
        key: &str,
        fingerprint: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<BeginOutcome, GuardError> {
        let mut records = self.records();

        match assess_begin(records.get(key), fingerprint, now) {
            BeginDecision::Insert => {
                records.insert(
                    key.to_string(),
                    IdempotencyRecord {
                        key: key.to_string(),
                        payload_fingerprint: fingerprint.to_string(),
                        state: OperationState::InFlight,
                        attempt_count: 1,
                        lease_expires_at: Some(now + self.lease_ttl),
                        result_snapshot_json: None,
                        last_error: None,
                        first_seen_at: now,
                        last_seen_at: now,
                        correlation_id: Some(correlation_id.to_string()),
                    },
                );
                Ok(BeginOutcome::Proceed { attempt: 1 })
            }
            BeginDecision::Steal { attempt } => {
                if let Some(record) = records.get_mut(key) {
                    record.attempt_count = attempt;
                    record.lease_expires_at = Some(now + self.lease_ttl);
                    record.last_seen_at = now;
                    record.correlation_id = Some(correlation_id.to_string());
                }
                Ok(BeginOutcome::Proceed { attempt })
            }
            BeginDecision::Cached { result } => Ok(BeginOutcome::Cached { result }),
            BeginDecision::Busy { lease_expires_at } => {
                Ok(BeginOutcome::InProgress { lease_expires_at })
            }
            BeginDecision::Mismatch => {
                Err(GuardError::FingerprintMismatch { key: key.to_string() })
            }
        }
    }

    /// Records the terminal result and drops the lease. A key completes at
    /// most once.
    pub fn complete(
        &self,
        key: &str,
        result_json: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GuardError> {
        let mut records = self.records();
        let record = records
            .get_mut(key)
            .ok_or_else(|| GuardError::NotInFlight { key: key.to_string() })?;

        if record.state == OperationState::Completed {
            return Err(GuardError::AlreadyCompleted { key: key.to_string() });
        }

        record.state = OperationState::Completed;
        record.result_snapshot_json = Some(result_json.to_string());
        record.lease_expires_at = None;
        record.last_seen_at = now;
        Ok(())
    }

    /// Abandons the lease after a failure so an immediate retry may proceed
    /// without waiting out the TTL.
    pub fn release(&self, key: &str, error: &str, now: DateTime<Utc>) -> Result<(), GuardError> {
        let mut records = self.records();
        let record = records
            .get_mut(key)
            .ok_or_else(|| GuardError::NotInFlight { key: key.to_string() })?;

        if record.state == OperationState::Completed {
            return Err(GuardError::AlreadyCompleted { key: key.to_string() });
        }

        record.lease_expires_at = Some(now);
        record.last_error = Some(error.to_string());
        record.last_seen_at = now;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<IdempotencyRecord> {
        self.records().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{
        derive_operation_key, fingerprint_payload, BeginOutcome, GuardError,
        InMemoryIdempotencyGuard,
    };

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    fn guard() -> InMemoryIdempotencyGuard {
        InMemoryIdempotencyGuard::new(Duration::seconds(3600))
    }

    #[test]
    fn first_begin_acquires_a_lease() {
        let guard = guard();
        let outcome = guard.begin("op-1", "fp-a", "req-1", now()).unwrap();

        assert_eq!(outcome, BeginOutcome::Proceed { attempt: 1 });
        let record = guard.get("op-1").unwrap();
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.lease_expires_at, Some(now() + Duration::seconds(3600)));
    }

    #[test]
    fn completed_operation_replays_the_stored_result() {
        let guard = guard();
        guard.begin("op-1", "fp-a", "req-1", now()).unwrap();
        guard.complete("op-1", r#"{"staging_id":"stg-1"}"#, now()).unwrap();

        let outcome = guard.begin("op-1", "fp-a", "req-2", now() + Duration::days(2)).unwrap();
        assert_eq!(
            outcome,
            BeginOutcome::Cached { result: r#"{"staging_id":"stg-1"}"#.to_string() }
        );
    }

    #[test]
    fn reused_key_with_different_payload_is_a_conflict() {
        let guard = guard();
        guard.begin("op-1", "fp-a", "req-1", now()).unwrap();

        let in_flight = guard.begin("op-1", "fp-b", "req-2", now());
        assert_eq!(in_flight, Err(GuardError::FingerprintMismatch { key: "op-1".to_string() }));

        guard.complete("op-1", "{}", now()).unwrap();
        let completed = guard.begin("op-1", "fp-b", "req-3", now());
        assert_eq!(completed, Err(GuardError::FingerprintMismatch { key: "op-1".to_string() }));
    }

    #[test]
    fn live_lease_reports_in_progress() {
        let guard = guard();
        guard.begin("op-1", "fp-a", "req-1", now()).unwrap();

        let outcome = guard.begin("op-1", "fp-a", "req-2", now() + Duration::minutes(5)).unwrap();
        assert_eq!(
            outcome,
            BeginOutcome::InProgress { lease_expires_at: now() + Duration::seconds(3600) }
        );
    }

    #[test]
    fn expired_lease_admits_exactly_one_stealer() {
        let guard = guard();
        guard.begin("op-1", "fp-a", "req-1", now()).unwrap();

        let after_expiry = now() + Duration::seconds(3601);
        let stolen = guard.begin("op-1", "fp-a", "req-2", after_expiry).unwrap();
        assert_eq!(stolen, BeginOutcome::Proceed { attempt: 2 });

        let crowded_out = guard.begin("op-1", "fp-a", "req-3", after_expiry).unwrap();
        assert!(matches!(crowded_out, BeginOutcome::InProgress { .. }));
    }

    #[test]
    fn complete_never_happens_twice() {
        let guard = guard();
        guard.begin("op-1", "fp-a", "req-1", now()).unwrap();
        guard.complete("op-1", "{}", now()).unwrap();

        let second = guard.complete("op-1", r#"{"other":true}"#, now());
        assert_eq!(second, Err(GuardError::AlreadyCompleted { key: "op-1".to_string() }));
    }

    #[test]
    fn complete_requires_an_in_flight_record() {
        let guard = guard();
        let result = guard.complete("missing", "{}", now());
        assert_eq!(result, Err(GuardError::NotInFlight { key: "missing".to_string() }));
    }

    #[test]
    fn release_invites_an_immediate_retry() {
        let guard = guard();
        guard.begin("op-1", "fp-a", "req-1", now()).unwrap();
        guard.release("op-1", "adapter timeout", now()).unwrap();

        let retried = guard.begin("op-1", "fp-a", "req-2", now()).unwrap();
        assert_eq!(retried, BeginOutcome::Proceed { attempt: 2 });

        let record = guard.get("op-1").unwrap();
        assert_eq!(record.last_error.as_deref(), Some("adapter timeout"));
    }

    #[test]
    fn concurrent_begins_admit_one_executor() {
        let guard = guard();

        let outcomes: Vec<BeginOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|worker| {
                    let guard = &guard;
                    scope.spawn(move || {
                        guard
                            .begin("op-contended", "fp-a", &format!("req-{worker}"), now())
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        let proceeded = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, BeginOutcome::Proceed { .. }))
            .count();
        let waiting = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, BeginOutcome::InProgress { .. }))
            .count();

        assert_eq!(proceeded, 1);
        assert_eq!(waiting, 7);
    }

    #[test]
    fn operation_keys_are_full_sha256_hex() {
        let key = derive_operation_key("deal-42", "evt-close-1");

        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(key, derive_operation_key("deal-42", "evt-close-1"));
        assert_ne!(key, derive_operation_key("deal-42", "evt-close-2"));
    }

    #[test]
    fn payload_fingerprints_track_content() {
        let first = fingerprint_payload(&serde_json::json!({"amount": "100.00"}));
        let second = fingerprint_payload(&serde_json::json!({"amount": "100.00"}));
        let changed = fingerprint_payload(&serde_json::json!({"amount": "250.00"}));

        assert_eq!(first, second);
        assert_ne!(first, changed);
    }
}
