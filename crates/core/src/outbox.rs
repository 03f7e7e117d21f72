use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::domain::deal::DealId;
use crate::domain::event::{EventStatus, OutboxEvent};
use crate::errors::AdapterError;

/// Delivers one outbox event to its channel. Delivery must be idempotent on
/// the consumer side; the dispatcher redelivers after failures.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn deliver(&self, event: &OutboxEvent) -> Result<(), AdapterError>;
}

/// Single-process outbox. Events are recorded in the same critical section
/// as the state change that produced them and drained by a dispatcher loop.
pub struct InMemoryOutbox {
    state: Mutex<Vec<OutboxEvent>>,
}

impl Default for InMemoryOutbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self { state: Mutex::new(Vec::new()) }
    }

    fn state(&self) -> MutexGuard<'_, Vec<OutboxEvent>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn enqueue(
        &self,
        deal_id: Option<DealId>,
        event_type: &str,
        payload: serde_json::Value,
        channel: &str,
        now: DateTime<Utc>,
    ) -> OutboxEvent {
        let event = OutboxEvent {
            id: Uuid::new_v4().to_string(),
            deal_id,
            event_type: event_type.to_string(),
            payload,
            channel: channel.to_string(),
            status: EventStatus::Pending,
            attempts: 0,
            last_error: None,
            next_run_at: now,
            created_at: now,
            updated_at: now,
        };
        self.state().push(event.clone());
        event
    }

    /// Pushes every due event through the handler. Success marks the row
    /// dispatched; failure records the error and backs the row off by
    /// thirty seconds per attempt. Returns how many rows were delivered.
    pub async fn dispatch_pending(&self, handler: &dyn EventHandler, now: DateTime<Utc>) -> usize {
        let due: Vec<OutboxEvent> = {
            let state = self.state();
            state.iter().filter(|event| event.is_due(now)).cloned().collect()
        };

        let mut dispatched = 0;
        for event in due {
            let outcome = handler.deliver(&event).await;

            let mut state = self.state();
            let Some(row) = state.iter_mut().find(|row| row.id == event.id) else {
                continue;
            };
            row.attempts += 1;
            row.updated_at = now;
            match outcome {
                Ok(()) => {
                    row.status = EventStatus::Dispatched;
                    row.last_error = None;
                    dispatched += 1;
                }
                Err(error) => {
                    row.status = EventStatus::Failed;
                    row.last_error = Some(error.to_string());
                    row.next_run_at = now + Duration::seconds(30) * row.attempts as i32;
                }
            }
        }
        dispatched
    }

    pub fn events(&self) -> Vec<OutboxEvent> {
        self.state().clone()
    }

    pub fn events_for(&self, deal_id: &DealId) -> Vec<OutboxEvent> {
        self.state()
            .iter()
            .filter(|event| event.deal_id.as_ref() == Some(deal_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{EventHandler, InMemoryOutbox};
    use crate::domain::deal::DealId;
    use crate::domain::event::{event_types, EventStatus, OutboxEvent};
    use crate::errors::AdapterError;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap()
    }

    struct RecordingHandler {
        delivered: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    impl RecordingHandler {
        fn reliable() -> Self {
            Self { delivered: Mutex::new(Vec::new()), failures_left: AtomicUsize::new(0) }
        }

        fn failing_first(failures: usize) -> Self {
            Self { delivered: Mutex::new(Vec::new()), failures_left: AtomicUsize::new(failures) }
        }

        fn delivered_types(&self) -> Vec<String> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn deliver(&self, event: &OutboxEvent) -> Result<(), AdapterError> {
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(AdapterError::Retryable {
                    system: event.channel.clone(),
                    message: "webhook endpoint unreachable".to_string(),
                });
            }
            self.delivered.lock().unwrap().push(event.event_type.clone());
            Ok(())
        }
    }

    #[test]
    fn enqueued_events_start_pending_and_due() {
        let outbox = InMemoryOutbox::new();
        let event = outbox.enqueue(
            Some(DealId("D-1".to_string())),
            event_types::PAYMENT_SUCCEEDED,
            serde_json::json!({"payment_id": "PAY-1"}),
            "workflow",
            now(),
        );

        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.attempts, 0);
        assert!(event.is_due(now()));
        assert_eq!(outbox.events_for(&DealId("D-1".to_string())).len(), 1);
    }

    #[tokio::test]
    async fn dispatch_delivers_each_due_event_once() {
        let outbox = InMemoryOutbox::new();
        let handler = RecordingHandler::reliable();
        outbox.enqueue(None, event_types::INVOICE_POSTED, serde_json::json!({}), "workflow", now());
        outbox.enqueue(None, event_types::DEAL_CLOSED_WON, serde_json::json!({}), "workflow", now());

        let first_pass = outbox.dispatch_pending(&handler, now()).await;
        assert_eq!(first_pass, 2);
        assert_eq!(
            handler.delivered_types(),
            vec![event_types::INVOICE_POSTED.to_string(), event_types::DEAL_CLOSED_WON.to_string()]
        );
        assert!(outbox.events().iter().all(|event| event.status == EventStatus::Dispatched));

        let second_pass = outbox.dispatch_pending(&handler, now()).await;
        assert_eq!(second_pass, 0);
    }

    #[tokio::test]
    async fn failures_back_off_by_thirty_seconds_per_attempt() {
        let outbox = InMemoryOutbox::new();
        let handler = RecordingHandler::failing_first(2);
        outbox.enqueue(None, event_types::PAYMENT_FAILED, serde_json::json!({}), "workflow", now());

        assert_eq!(outbox.dispatch_pending(&handler, now()).await, 0);
        let after_first = &outbox.events()[0];
        assert_eq!(after_first.status, EventStatus::Failed);
        assert_eq!(after_first.attempts, 1);
        assert_eq!(after_first.next_run_at, now() + Duration::seconds(30));
        assert!(after_first.last_error.as_deref().unwrap_or("").contains("unreachable"));

        // Not due until the backoff elapses.
        assert_eq!(outbox.dispatch_pending(&handler, now() + Duration::seconds(10)).await, 0);
        assert_eq!(outbox.events()[0].attempts, 1);

        let second_try = now() + Duration::seconds(31);
        assert_eq!(outbox.dispatch_pending(&handler, second_try).await, 0);
        let after_second = &outbox.events()[0];
        assert_eq!(after_second.attempts, 2);
        assert_eq!(after_second.next_run_at, second_try + Duration::seconds(60));

        // Third attempt goes through and clears the error.
        let third_try = second_try + Duration::seconds(61);
        assert_eq!(outbox.dispatch_pending(&handler, third_try).await, 1);
        let delivered = &outbox.events()[0];
        assert_eq!(delivered.status, EventStatus::Dispatched);
        assert_eq!(delivered.last_error, None);
        assert_eq!(delivered.attempts, 3);
    }
}
