pub mod approval_router;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod guardrails;
pub mod idempotency_guard;
pub mod invoice_pipeline;
pub mod outbox;
pub mod policy_store;
pub mod settlement;
pub mod simulation;

pub use approval_router::{
    ApprovalDecision, ApprovalOutcome, ApprovalRouter, ChainOutcome, EscalationOutcome,
    RoutingError,
};
pub use audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink,
};
pub use domain::approval::{Approval, ApprovalId, ApprovalStatus, ApprovalStep};
pub use domain::deal::{Deal, DealId, DealStage, DealTerms, GuardrailStatus, RiskTier};
pub use domain::event::{EventStatus, OutboxEvent};
pub use domain::invoice::{AccountingSystem, Invoice, InvoiceStaging, InvoiceStagingStatus};
pub use domain::payment::{Payment, PaymentId, PaymentStatus};
pub use domain::policy::{Policy, PolicyConflict, PolicyId, PolicyScope, PolicyStatus, PolicyType};
pub use errors::{AdapterError, ApplicationError, DomainError, InterfaceError};
pub use guardrails::{
    GuardrailCheck, GuardrailEvaluator, GuardrailVerdict, GuardrailViolation, PolicySnapshot,
};
pub use idempotency_guard::{BeginOutcome, GuardError, InMemoryIdempotencyGuard};
pub use invoice_pipeline::{
    AccountingAdapter, InvoicePipeline, PostOutcome, StageOutcome, StagingError,
};
pub use outbox::{EventHandler, InMemoryOutbox};
pub use policy_store::{InMemoryPolicyStore, PolicyDraft, PolicyStoreError};
pub use settlement::{ProviderOutcome, SettlementError, SettlementOutcome, SettlementProcessor};
pub use simulation::{SimulationDeal, SimulationEngine, SimulationReport, SimulationSummary};
