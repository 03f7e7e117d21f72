use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use dealgate_core::audit::AuditEvent;
use dealgate_core::domain::approval::{Approval, ApprovalId};
use dealgate_core::domain::deal::{Deal, DealId, DealStage};
use dealgate_core::domain::event::OutboxEvent;
use dealgate_core::domain::idempotency::IdempotencyRecord;
use dealgate_core::domain::invoice::{Invoice, InvoiceId, InvoiceStaging, InvoiceStagingId};
use dealgate_core::domain::payment::{Payment, PaymentId};
use dealgate_core::domain::policy::{
    Policy, PolicyChangeRecord, PolicyConflict, PolicyId, PolicyStatus,
};

pub mod approval;
pub mod audit;
pub mod deal;
pub(crate) mod decode;
pub mod idempotency;
pub mod invoice;
pub mod outbox;
pub mod payment;
pub mod policy;

pub use approval::SqlApprovalRepository;
pub use audit::SqlAuditRepository;
pub use deal::SqlDealRepository;
pub use idempotency::{GuardStoreError, SqlIdempotencyRepository};
pub use invoice::SqlInvoiceRepository;
pub use outbox::SqlOutboxRepository;
pub use payment::SqlPaymentRepository;
pub use policy::SqlPolicyRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait DealRepository: Send + Sync {
    async fn find_by_id(&self, id: &DealId) -> Result<Option<Deal>, RepositoryError>;
    async fn list(&self, stage: Option<DealStage>) -> Result<Vec<Deal>, RepositoryError>;
    async fn save(&self, deal: Deal) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<Policy>, RepositoryError>;
    async fn list(&self, status: Option<PolicyStatus>) -> Result<Vec<Policy>, RepositoryError>;
    async fn versions_of(&self, lineage_id: &PolicyId) -> Result<Vec<Policy>, RepositoryError>;
    async fn active_policies(&self) -> Result<Vec<Policy>, RepositoryError>;
    async fn save(&self, policy: Policy) -> Result<(), RepositoryError>;

    /// Activates one policy and supersedes the active incumbent of the same
    /// (type, scope) in a single transaction. Returns the superseded ids.
    async fn activate_exclusive(
        &self,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> Result<Vec<PolicyId>, RepositoryError>;

    async fn record_conflict(&self, conflict: PolicyConflict) -> Result<(), RepositoryError>;
    async fn conflicts(&self) -> Result<Vec<PolicyConflict>, RepositoryError>;
    async fn conflicts_for(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<PolicyConflict>, RepositoryError>;
    async fn append_change(&self, record: PolicyChangeRecord) -> Result<(), RepositoryError>;
    async fn changes_for(
        &self,
        policy_id: &PolicyId,
    ) -> Result<Vec<PolicyChangeRecord>, RepositoryError>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError>;

    /// The deal's full chain, ordered by sequence.
    async fn chain_for_deal(&self, deal_id: &DealId) -> Result<Vec<Approval>, RepositoryError>;

    async fn open_past_due(&self, now: DateTime<Utc>) -> Result<Vec<Approval>, RepositoryError>;
    async fn save(&self, approval: Approval) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    async fn find_staging(
        &self,
        id: &InvoiceStagingId,
    ) -> Result<Option<InvoiceStaging>, RepositoryError>;
    async fn staging_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<InvoiceStaging>, RepositoryError>;
    async fn stagings_for_deal(
        &self,
        deal_id: &DealId,
    ) -> Result<Vec<InvoiceStaging>, RepositoryError>;

    /// How many stagings carry the given invoice date. Drives the
    /// per-day sequence in invoice numbers.
    async fn stagings_created_on(&self, date: NaiveDate) -> Result<u32, RepositoryError>;

    async fn save_staging(&self, staging: InvoiceStaging) -> Result<(), RepositoryError>;
    async fn find_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>, RepositoryError>;
    async fn invoices_for_deal(&self, deal_id: &DealId) -> Result<Vec<Invoice>, RepositoryError>;
    async fn save_invoice(&self, invoice: Invoice) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn find_by_id(&self, id: &PaymentId) -> Result<Option<Payment>, RepositoryError>;
    async fn find_by_key(&self, idempotency_key: &str)
        -> Result<Option<Payment>, RepositoryError>;

    /// Every attempt of one settlement intent, ordered by attempt number.
    async fn attempts_for(&self, parent_key: &str) -> Result<Vec<Payment>, RepositoryError>;

    async fn payments_for_deal(&self, deal_id: &DealId) -> Result<Vec<Payment>, RepositoryError>;
    async fn save(&self, payment: Payment) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait IdempotencyRepository: Send + Sync {
    async fn find_operation(
        &self,
        operation_key: &str,
    ) -> Result<Option<IdempotencyRecord>, RepositoryError>;

    async fn save_operation(&self, record: IdempotencyRecord) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn save(&self, event: OutboxEvent) -> Result<(), RepositoryError>;
    async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxEvent>, RepositoryError>;
    async fn events_for_deal(&self, deal_id: &DealId) -> Result<Vec<OutboxEvent>, RepositoryError>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<(), RepositoryError>;
    async fn events_for_deal(&self, deal_id: &DealId) -> Result<Vec<AuditEvent>, RepositoryError>;
    async fn recent(&self, limit: u32) -> Result<Vec<AuditEvent>, RepositoryError>;
}
