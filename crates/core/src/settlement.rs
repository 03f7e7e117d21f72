use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::deal::DealId;
use crate::domain::payment::{Payment, PaymentId, PaymentStatus};
use crate::errors::DomainError;
use crate::idempotency_guard::{fingerprint_payload, BeginOutcome, InMemoryIdempotencyGuard};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SettlementError {
    #[error("payment cannot move from {from:?} to {to:?}")]
    InvalidTransition { from: PaymentStatus, to: PaymentStatus },
    #[error("unknown payment `{payment_id}`")]
    UnknownPayment { payment_id: PaymentId },
    #[error("no settlement intent under key `{key}`")]
    UnknownIntent { key: String },
    #[error("callback signature was rejected")]
    SignatureRejected,
}

/// pending -> succeeded | failed, succeeded -> rolled_back. Identical-state
/// transitions are idempotent no-ops; nothing else moves.
pub fn can_transition(from: PaymentStatus, to: PaymentStatus) -> bool {
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (PaymentStatus::Pending, PaymentStatus::Succeeded)
            | (PaymentStatus::Pending, PaymentStatus::Failed)
            | (PaymentStatus::Succeeded, PaymentStatus::RolledBack)
    )
}

/// Checks a provider callback body against its HMAC-SHA256 signature.
pub fn verify_callback_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    hmac_hex(secret, body).eq_ignore_ascii_case(signature.trim())
}

fn hmac_hex(secret: &str, payload: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(payload);
            encode_hex(&mac.finalize().into_bytes())
        }
        Err(_) => sha256_hex(payload),
    }
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

/// What the payment provider reported for an attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Succeeded {
        #[serde(default)]
        provider_reference: Option<String>,
    },
    Failed {
        failure_reason: String,
        #[serde(default)]
        error_code: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum SettlementOutcome {
    Created(Payment),
    Replayed(Payment),
    InFlight { lease_expires_at: DateTime<Utc> },
}

#[derive(Debug, Deserialize)]
struct IntentReceipt {
    payment_id: String,
}

/// Settlement attempts for deal payments. Every intent row is written ahead
/// of trusting any provider response, one row per idempotency key; retries
/// get derived sub-keys so a terminal key is never recharged.
pub struct SettlementProcessor {
    guard: Arc<InMemoryIdempotencyGuard>,
    callback_secret: Option<SecretString>,
    state: Mutex<Vec<Payment>>,
}

impl SettlementProcessor {
    pub fn new(guard: Arc<InMemoryIdempotencyGuard>, callback_secret: Option<SecretString>) -> Self {
        Self { guard, callback_secret, state: Mutex::new(Vec::new()) }
    }

    fn state(&self) -> MutexGuard<'_, Vec<Payment>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Persists one pending intent per key. Replaying the key with the same
    /// amount returns the existing row; a different amount under the same
    /// key is refused.
    pub fn create(
        &self,
        deal_id: &DealId,
        idempotency_key: &str,
        amount: Decimal,
        currency: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, DomainError> {
        let fingerprint = fingerprint_payload(&serde_json::json!({
            "deal_id": deal_id.0,
            "idempotency_key": idempotency_key,
            "amount": amount.to_string(),
            "currency": currency,
        }));

        match self.guard.begin(idempotency_key, &fingerprint, correlation_id, now)? {
            BeginOutcome::Proceed { .. } => {
                let payment = Payment {
                    id: PaymentId(Uuid::new_v4().to_string()),
                    deal_id: deal_id.clone(),
                    idempotency_key: idempotency_key.to_string(),
                    parent_key: idempotency_key.to_string(),
                    attempt_number: 1,
                    status: PaymentStatus::Pending,
                    amount,
                    currency: currency.to_string(),
                    provider_reference: None,
                    failure_reason: None,
                    error_code: None,
                    completed_at: None,
                    rolled_back_at: None,
                    auto_recovered: false,
                    created_at: now,
                    updated_at: now,
                };
                self.state().push(payment.clone());

                let receipt = serde_json::json!({ "payment_id": payment.id.0 }).to_string();
                self.guard.complete(idempotency_key, &receipt, now)?;
                Ok(SettlementOutcome::Created(payment))
            }
            BeginOutcome::Cached { result } => Ok(SettlementOutcome::Replayed(
                self.payment_from_receipt(&result)?,
            )),
            BeginOutcome::InProgress { lease_expires_at } => {
                let state = self.state();
                match state.iter().find(|payment| payment.idempotency_key == idempotency_key) {
                    Some(payment) => Ok(SettlementOutcome::Replayed(payment.clone())),
                    None => Ok(SettlementOutcome::InFlight { lease_expires_at }),
                }
            }
        }
    }

    /// Applies a provider callback to a pending attempt. A succeeded
    /// attempt is marked auto-recovered when an earlier attempt of the same
    /// intent had failed. Re-delivery of the same outcome is a no-op.
    pub fn record_provider_outcome(
        &self,
        payment_id: &PaymentId,
        outcome: &ProviderOutcome,
        now: DateTime<Utc>,
    ) -> Result<Payment, DomainError> {
        let mut state = self.state();
        let index = state
            .iter()
            .position(|payment| payment.id == *payment_id)
            .ok_or_else(|| SettlementError::UnknownPayment { payment_id: payment_id.clone() })?;

        let target = match outcome {
            ProviderOutcome::Succeeded { .. } => PaymentStatus::Succeeded,
            ProviderOutcome::Failed { .. } => PaymentStatus::Failed,
        };
        if state[index].status == target {
            return Ok(state[index].clone());
        }
        if !can_transition(state[index].status, target) {
            return Err(SettlementError::InvalidTransition {
                from: state[index].status,
                to: target,
            }
            .into());
        }

        let parent_key = state[index].parent_key.clone();
        let recovered = target == PaymentStatus::Succeeded
            && state.iter().enumerate().any(|(other, payment)| {
                other != index
                    && payment.parent_key == parent_key
                    && payment.status == PaymentStatus::Failed
            });

        let payment = &mut state[index];
        match outcome {
            ProviderOutcome::Succeeded { provider_reference } => {
                payment.status = PaymentStatus::Succeeded;
                payment.provider_reference = provider_reference.clone();
                payment.completed_at = Some(now);
                payment.auto_recovered = recovered;
            }
            ProviderOutcome::Failed { failure_reason, error_code } => {
                payment.status = PaymentStatus::Failed;
                payment.failure_reason = Some(failure_reason.clone());
                payment.error_code = error_code.clone();
            }
        }
        payment.updated_at = now;
        Ok(payment.clone())
    }

    /// Signature-checked callback entry point. With no configured secret,
    /// unsigned callbacks are accepted as-is.
    pub fn record_callback(
        &self,
        payment_id: &PaymentId,
        outcome: &ProviderOutcome,
        body: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Payment, DomainError> {
        if let Some(secret) = &self.callback_secret {
            let verified = signature.is_some_and(|signature| {
                verify_callback_signature(secret.expose_secret(), body, signature)
            });
            if !verified {
                return Err(SettlementError::SignatureRejected.into());
            }
        }
        self.record_provider_outcome(payment_id, outcome, now)
    }

    /// Opens a fresh pending attempt for a failed intent under the derived
    /// `<parent>:attempt-<n>` sub-key. The amount is carried over from the
    /// prior attempt; terminal keys themselves are never reused.
    pub fn retry(
        &self,
        parent_key: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SettlementOutcome, DomainError> {
        let (deal_id, amount, currency, next_attempt) = {
            let state = self.state();
            let mut attempts: Vec<&Payment> =
                state.iter().filter(|payment| payment.parent_key == parent_key).collect();
            attempts.sort_by_key(|payment| payment.attempt_number);

            let latest = attempts.last().ok_or_else(|| SettlementError::UnknownIntent {
                key: parent_key.to_string(),
            })?;
            if latest.status != PaymentStatus::Failed {
                return Err(SettlementError::InvalidTransition {
                    from: latest.status,
                    to: PaymentStatus::Pending,
                }
                .into());
            }
            (latest.deal_id.clone(), latest.amount, latest.currency.clone(), latest.attempt_number + 1)
        };

        let sub_key = format!("{parent_key}:attempt-{next_attempt}");
        let fingerprint = fingerprint_payload(&serde_json::json!({
            "parent_key": parent_key,
            "attempt_number": next_attempt,
            "amount": amount.to_string(),
            "currency": currency,
        }));

        match self.guard.begin(&sub_key, &fingerprint, correlation_id, now)? {
            BeginOutcome::Proceed { .. } => {
                let payment = Payment {
                    id: PaymentId(Uuid::new_v4().to_string()),
                    deal_id,
                    idempotency_key: sub_key.clone(),
                    parent_key: parent_key.to_string(),
                    attempt_number: next_attempt,
                    status: PaymentStatus::Pending,
                    amount,
                    currency,
                    provider_reference: None,
                    failure_reason: None,
                    error_code: None,
                    completed_at: None,
                    rolled_back_at: None,
                    auto_recovered: false,
                    created_at: now,
                    updated_at: now,
                };
                self.state().push(payment.clone());

                let receipt = serde_json::json!({ "payment_id": payment.id.0 }).to_string();
                self.guard.complete(&sub_key, &receipt, now)?;
                Ok(SettlementOutcome::Created(payment))
            }
            BeginOutcome::Cached { result } => Ok(SettlementOutcome::Replayed(
                self.payment_from_receipt(&result)?,
            )),
            BeginOutcome::InProgress { lease_expires_at } => {
                let state = self.state();
                match state.iter().find(|payment| payment.idempotency_key == sub_key) {
                    Some(payment) => Ok(SettlementOutcome::Replayed(payment.clone())),
                    None => Ok(SettlementOutcome::InFlight { lease_expires_at }),
                }
            }
        }
    }

    /// Compensates a succeeded payment. Rolling back an already rolled-back
    /// payment changes nothing; any other source state is refused.
    pub fn rollback(
        &self,
        payment_id: &PaymentId,
        now: DateTime<Utc>,
    ) -> Result<Payment, DomainError> {
        let mut state = self.state();
        let payment = state
            .iter_mut()
            .find(|payment| payment.id == *payment_id)
            .ok_or_else(|| SettlementError::UnknownPayment { payment_id: payment_id.clone() })?;

        if payment.status == PaymentStatus::RolledBack {
            return Ok(payment.clone());
        }
        if !can_transition(payment.status, PaymentStatus::RolledBack) {
            return Err(SettlementError::InvalidTransition {
                from: payment.status,
                to: PaymentStatus::RolledBack,
            }
            .into());
        }

        payment.status = PaymentStatus::RolledBack;
        payment.rolled_back_at = Some(now);
        payment.updated_at = now;
        Ok(payment.clone())
    }

    pub fn payment(&self, payment_id: &PaymentId) -> Option<Payment> {
        self.state().iter().find(|payment| payment.id == *payment_id).cloned()
    }

    /// Attempts of one intent, in attempt order.
    pub fn attempts(&self, parent_key: &str) -> Vec<Payment> {
        let mut attempts: Vec<Payment> = self
            .state()
            .iter()
            .filter(|payment| payment.parent_key == parent_key)
            .cloned()
            .collect();
        attempts.sort_by_key(|payment| payment.attempt_number);
        attempts
    }

    pub fn payments_for(&self, deal_id: &DealId) -> Vec<Payment> {
        self.state().iter().filter(|payment| payment.deal_id == *deal_id).cloned().collect()
    }

    fn payment_from_receipt(&self, result: &str) -> Result<Payment, DomainError> {
        let receipt: IntentReceipt = serde_json::from_str(result).map_err(|_| {
            DomainError::Validation("stored settlement receipt is unreadable".to_owned())
        })?;
        let state = self.state();
        state
            .iter()
            .find(|payment| payment.id.0 == receipt.payment_id)
            .cloned()
            .ok_or_else(|| {
                DomainError::Validation(format!("payment `{}` is missing", receipt.payment_id))
            })
    }
}
