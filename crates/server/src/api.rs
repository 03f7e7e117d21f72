//! Shared plumbing for the JSON API handlers: error replies keyed by a
//! per-request correlation id, plus best-effort audit and outbox writes.

use axum::{http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use dealgate_core::audit::AuditEvent;
use dealgate_core::domain::deal::DealId;
use dealgate_core::domain::event::{EventStatus, OutboxEvent};
use dealgate_core::errors::{ApplicationError, InterfaceError};
use dealgate_db::repositories::{
    AuditRepository, GuardStoreError, OutboxRepository, RepositoryError, SqlAuditRepository,
    SqlOutboxRepository,
};
use dealgate_db::DbPool;

/// Channel every API-originated outbox event is published on.
pub const WORKFLOW_CHANNEL: &str = "workflow";

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub correlation_id: String,
}

pub type ErrorReply = (StatusCode, Json<ApiError>);

pub fn correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Maps an application error onto a status and body. Validation and conflict
/// replies carry the specific message; server-side failures carry only the
/// generic user message, with the detail kept in the log.
pub fn error_reply(error: ApplicationError, correlation_id: &str) -> ErrorReply {
    let interface = error.into_interface(correlation_id);
    let (status, message) = match &interface {
        InterfaceError::BadRequest { message, .. } => {
            (StatusCode::BAD_REQUEST, message.clone())
        }
        InterfaceError::Conflict { message, .. } => (StatusCode::CONFLICT, message.clone()),
        InterfaceError::ServiceUnavailable { message, .. } => {
            error!(
                error = %message,
                correlation_id = %correlation_id,
                "request failed against a downstream dependency"
            );
            (StatusCode::SERVICE_UNAVAILABLE, interface.user_message().to_string())
        }
        InterfaceError::Internal { message, .. } => {
            error!(error = %message, correlation_id = %correlation_id, "internal error");
            (StatusCode::INTERNAL_SERVER_ERROR, interface.user_message().to_string())
        }
    };

    (status, Json(ApiError { error: message, correlation_id: correlation_id.to_string() }))
}

pub fn bad_request(message: impl Into<String>, correlation_id: &str) -> ErrorReply {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            error: message.into(),
            correlation_id: correlation_id.to_string(),
        }),
    )
}

pub fn not_found(entity: &str, id: &str, correlation_id: &str) -> ErrorReply {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError {
            error: format!("{entity} `{id}` was not found"),
            correlation_id: correlation_id.to_string(),
        }),
    )
}

pub fn db_error(error: RepositoryError, correlation_id: &str) -> ErrorReply {
    error_reply(ApplicationError::Persistence(error.to_string()), correlation_id)
}

pub fn guard_error(error: GuardStoreError, correlation_id: &str) -> ErrorReply {
    match error {
        GuardStoreError::Guard(guard) => {
            error_reply(dealgate_core::errors::DomainError::from(guard).into(), correlation_id)
        }
        GuardStoreError::Repository(repository) => db_error(repository, correlation_id),
    }
}

/// Appends an audit event without failing the request. A lost audit row is
/// logged and swallowed; the state change it describes has already happened.
pub async fn record_audit(pool: &DbPool, event: AuditEvent) {
    let deal_id = event.deal_id.clone();
    let correlation_id = event.correlation_id.clone();
    let repository = SqlAuditRepository::new(pool.clone());

    if let Err(error) = repository.append(event).await {
        error!(
            event_name = "api.audit.write_failed",
            correlation_id = %correlation_id,
            deal_id = %deal_id.map(|id| id.0).unwrap_or_default(),
            error = %error,
            "failed to record audit event"
        );
    }
}

/// Enqueues a workflow event for the dispatcher loop. Best effort for the
/// same reason as [`record_audit`]: consumers are idempotent and a missed
/// event surfaces in the log rather than failing a completed operation.
pub async fn enqueue_event(
    pool: &DbPool,
    deal_id: Option<DealId>,
    event_type: &str,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) {
    let event = OutboxEvent {
        id: Uuid::new_v4().to_string(),
        deal_id: deal_id.clone(),
        event_type: event_type.to_string(),
        payload,
        channel: WORKFLOW_CHANNEL.to_string(),
        status: EventStatus::Pending,
        attempts: 0,
        last_error: None,
        next_run_at: now,
        created_at: now,
        updated_at: now,
    };

    let repository = SqlOutboxRepository::new(pool.clone());
    if let Err(error) = repository.save(event).await {
        error!(
            event_name = "api.outbox.write_failed",
            event_type = %event_type,
            deal_id = %deal_id.map(|id| id.0).unwrap_or_default(),
            error = %error,
            "failed to enqueue workflow event"
        );
    }
}
