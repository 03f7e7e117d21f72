use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::deal::DealId;

/// Event type names published to the outbox.
pub mod event_types {
    pub const GUARDRAIL_VIOLATION: &str = "guardrail.violation";
    pub const APPROVAL_ESCALATED: &str = "approval.escalated";
    pub const DEAL_CLOSED_WON: &str = "deal.closed_won";
    pub const INVOICE_POSTED: &str = "invoice.posted";
    pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const PAYMENT_ROLLED_BACK: &str = "payment.rolled_back";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Dispatched,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "dispatched" => Some(Self::Dispatched),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A side effect recorded for at-least-once delivery to external workflow
/// consumers. Consumers are idempotent, so redelivery is safe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: String,
    pub deal_id: Option<DealId>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub channel: String,
    pub status: EventStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Failed rows become due again once their backoff elapses; only
    /// dispatched rows are done for good.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status != EventStatus::Dispatched && self.next_run_at <= now
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{EventStatus, OutboxEvent};

    #[test]
    fn status_encoding_round_trips() {
        for status in [EventStatus::Pending, EventStatus::Dispatched, EventStatus::Failed] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn dispatched_events_are_never_due_again() {
        let now = Utc::now();
        let mut event = OutboxEvent {
            id: "EVT-1".to_string(),
            deal_id: None,
            event_type: super::event_types::PAYMENT_SUCCEEDED.to_string(),
            payload: serde_json::json!({"payment_id": "PAY-1"}),
            channel: "workflow".to_string(),
            status: EventStatus::Pending,
            attempts: 0,
            last_error: None,
            next_run_at: now - Duration::seconds(5),
            created_at: now - Duration::minutes(1),
            updated_at: now - Duration::minutes(1),
        };
        assert!(event.is_due(now));

        event.next_run_at = now + Duration::seconds(30);
        assert!(!event.is_due(now));

        // A failed row waits out its backoff, then retries.
        event.status = EventStatus::Failed;
        assert!(!event.is_due(now));
        assert!(event.is_due(now + Duration::seconds(31)));

        event.status = EventStatus::Dispatched;
        event.next_run_at = now - Duration::seconds(5);
        assert!(!event.is_due(now));
    }
}
