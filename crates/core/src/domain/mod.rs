pub mod approval;
pub mod deal;
pub mod event;
pub mod idempotency;
pub mod invoice;
pub mod payment;
pub mod policy;
