use thiserror::Error;

use crate::approval_router::RoutingError;
use crate::domain::deal::StageTransitionError;
use crate::idempotency_guard::GuardError;
use crate::invoice_pipeline::StagingError;
use crate::policy_store::PolicyStoreError;
use crate::settlement::SettlementError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Stage(#[from] StageTransitionError),
    #[error(transparent)]
    Guard(#[from] GuardError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
    #[error(transparent)]
    Policy(#[from] PolicyStoreError),
}

/// Coarse classification used when mapping domain failures onto the
/// interface tier. Guardrail violations are never errors; they travel as
/// structured verdicts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainErrorClass {
    Validation,
    Conflict,
    StateTransition,
}

impl DomainError {
    pub fn class(&self) -> DomainErrorClass {
        match self {
            Self::Validation(_) => DomainErrorClass::Validation,
            Self::Conflict(_) => DomainErrorClass::Conflict,
            Self::Stage(_) => DomainErrorClass::StateTransition,
            Self::Guard(GuardError::FingerprintMismatch { .. })
            | Self::Guard(GuardError::AlreadyCompleted { .. }) => DomainErrorClass::Conflict,
            Self::Guard(GuardError::NotInFlight { .. }) => DomainErrorClass::StateTransition,
            Self::Routing(RoutingError::NoPendingChain { .. }) => DomainErrorClass::Validation,
            Self::Routing(_) => DomainErrorClass::StateTransition,
            Self::Staging(StagingError::InvalidTransition { .. }) => {
                DomainErrorClass::StateTransition
            }
            Self::Staging(_) => DomainErrorClass::Validation,
            Self::Settlement(SettlementError::InvalidTransition { .. }) => {
                DomainErrorClass::StateTransition
            }
            Self::Settlement(_) => DomainErrorClass::Validation,
            Self::Policy(PolicyStoreError::ActivationConflict { .. })
            | Self::Policy(PolicyStoreError::NotActivatable { .. })
            | Self::Policy(PolicyStoreError::StaleVersion { .. }) => DomainErrorClass::Conflict,
            Self::Policy(_) => DomainErrorClass::Validation,
        }
    }
}

/// Failure talking to an external accounting or payment system. Retryable
/// errors may be replayed under the same idempotency key; fatal errors leave
/// the operation parked for manual intervention.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("{system} temporarily unavailable: {message}")]
    Retryable { system: String, message: String },
    #[error("{system} rejected the request: {message}")]
    Fatal { system: String, message: String },
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn system(&self) -> &str {
        match self {
            Self::Retryable { system, .. } | Self::Fatal { system, .. } => system,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Conflict { .. } => {
                "The request conflicts with the current state. Refresh and retry."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(domain) => match domain.class() {
                DomainErrorClass::Validation => Self::BadRequest {
                    message: domain.to_string(),
                    correlation_id: "unassigned".to_owned(),
                },
                DomainErrorClass::Conflict | DomainErrorClass::StateTransition => Self::Conflict {
                    message: domain.to_string(),
                    correlation_id: "unassigned".to_owned(),
                },
            },
            ApplicationError::Adapter(adapter) if adapter.is_retryable() => {
                Self::ServiceUnavailable {
                    message: adapter.to_string(),
                    correlation_id: "unassigned".to_owned(),
                }
            }
            ApplicationError::Adapter(adapter) => {
                Self::Internal { message: adapter.to_string(), correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}
