use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    InFlight,
    Completed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_flight" => Some(Self::InFlight),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Ledger row behind the idempotency guard. One row per operation key; the
/// row is created on first `begin` and never deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub payload_fingerprint: String,
    pub state: OperationState,
    pub attempt_count: u32,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result_snapshot_json: Option<String>,
    pub last_error: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

impl IdempotencyRecord {
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.state, self.lease_expires_at) {
            (OperationState::InFlight, Some(expires_at)) => now >= expires_at,
            _ => false,
        }
    }
}
