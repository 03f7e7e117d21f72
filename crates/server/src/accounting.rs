//! Outbound client for the external accounting system.
//!
//! Wraps the provider's invoice endpoint behind the `AccountingAdapter`
//! trait so the posting flow stays testable against the in-memory fake.
//! Retryable provider errors are retried here with capped exponential
//! backoff plus jitter; the caller only ever sees the final outcome.

use std::time::Duration;

use async_trait::async_trait;
use dealgate_core::config::AccountingConfig;
use dealgate_core::domain::invoice::{AccountingSystem, InvoiceStaging};
use dealgate_core::errors::AdapterError;
use dealgate_core::invoice_pipeline::AccountingAdapter;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::warn;

const POST_MAX_ATTEMPTS: u32 = 3;
const POST_BASE_RETRY_DELAY_MS: u64 = 250;
const POST_MAX_RETRY_DELAY_MS: u64 = 2_000;

pub struct HttpAccountingAdapter {
    system: AccountingSystem,
    base_url: String,
    api_key: Option<SecretString>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct PostInvoiceResponse {
    external_invoice_id: String,
}

impl HttpAccountingAdapter {
    /// Builds the adapter from config. Returns `None` when the accounting
    /// integration is disabled or has no base URL configured.
    pub fn from_config(config: &AccountingConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let base_url = config.base_url.as_deref()?.trim_end_matches('/').to_string();
        Some(Self {
            system: config.system,
            base_url,
            api_key: config.api_key.clone(),
            client: Client::new(),
        })
    }

    fn classify_status(&self, status: reqwest::StatusCode, body: String) -> AdapterError {
        let message = if body.trim().is_empty() {
            format!("status {status}")
        } else {
            format!("status {status}: {body}")
        };
        let system = self.system.as_str().to_string();
        if status.is_server_error()
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            AdapterError::Retryable { system, message }
        } else {
            AdapterError::Fatal { system, message }
        }
    }
}

#[async_trait]
impl AccountingAdapter for HttpAccountingAdapter {
    fn system(&self) -> AccountingSystem {
        self.system
    }

    async fn post_invoice(&self, staging: &InvoiceStaging) -> Result<String, AdapterError> {
        let url = format!("{}/api/invoices", self.base_url);
        let mut request = self.client.post(&url).json(staging);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|error| {
            let system = self.system.as_str().to_string();
            if error.is_timeout() || error.is_connect() {
                AdapterError::Retryable { system, message: error.to_string() }
            } else {
                AdapterError::Fatal { system, message: error.to_string() }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status, body));
        }

        let payload: PostInvoiceResponse = response.json().await.map_err(|error| {
            AdapterError::Fatal {
                system: self.system.as_str().to_string(),
                message: format!("invalid post response: {error}"),
            }
        })?;
        Ok(payload.external_invoice_id)
    }
}

/// Posts a staging through the adapter, retrying retryable failures with
/// capped exponential backoff plus jitter. Fatal failures return at once.
pub async fn post_with_retry(
    adapter: &dyn AccountingAdapter,
    staging: &InvoiceStaging,
) -> Result<String, AdapterError> {
    let mut attempt = 0_u32;
    loop {
        match adapter.post_invoice(staging).await {
            Ok(external_id) => return Ok(external_id),
            Err(error) if error.is_retryable() && attempt + 1 < POST_MAX_ATTEMPTS => {
                attempt += 1;
                let delay = retry_delay(attempt);
                warn!(
                    event_name = "accounting.post.retry",
                    invoice_number = %staging.invoice_number,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying invoice post after retryable provider error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    use rand::Rng;

    let exponent = attempt.min(16);
    let multiplier = 1_u64 << exponent;
    let base = POST_BASE_RETRY_DELAY_MS.saturating_mul(multiplier).min(POST_MAX_RETRY_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}
