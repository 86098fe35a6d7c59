//! Payment gateway trait and the Stripe REST implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PaymentError, SignatureError};
use crate::money::Amount;
use crate::webhook::{ParsedEvent, WebhookVerifier};

/// Default API base URL.
pub const API_URL: &str = "https://api.stripe.com";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Handle to a created payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentHandle {
    /// Provider intent id.
    pub intent_id: String,
    /// Secret handed to the client-side checkout.
    pub client_secret: Option<String>,
}

/// Handle to an issued refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundHandle {
    /// Provider refund id.
    pub refund_id: String,
    /// Provider refund status (`pending`, `succeeded`, ...).
    pub status: String,
}

/// Trait for payment providers.
///
/// Creating intents and refunds must be safe to retry with the same
/// idempotency key. Verification is the only way events enter the system.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent for a job.
    async fn create_intent(
        &self,
        amount: Amount,
        job_id: &str,
        idempotency_key: &str,
    ) -> Result<IntentHandle, PaymentError>;

    /// Refund (part of) a confirmed intent.
    async fn refund(
        &self,
        intent_id: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<RefundHandle, PaymentError>;

    /// Verify a webhook delivery and parse its event.
    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<ParsedEvent, SignatureError>;
}

#[derive(Debug, Deserialize)]
struct IntentResponse {
    id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Stripe payment gateway.
#[derive(Clone)]
pub struct StripeGateway {
    /// HTTP client.
    client: Client,
    /// Secret API key.
    secret_key: String,
    /// Base URL.
    api_url: String,
    /// Webhook verifier.
    verifier: WebhookVerifier,
}

impl StripeGateway {
    /// Create a new gateway.
    ///
    /// # Errors
    /// Returns error if credentials are missing or the HTTP client cannot be created.
    pub fn new(
        secret_key: impl Into<String>,
        verifier: WebhookVerifier,
    ) -> Result<Self, PaymentError> {
        Self::with_base_url(secret_key, verifier, API_URL)
    }

    /// Create a gateway against a custom base URL.
    ///
    /// # Errors
    /// Returns error if credentials are missing or the HTTP client cannot be created.
    pub fn with_base_url(
        secret_key: impl Into<String>,
        verifier: WebhookVerifier,
        api_url: impl Into<String>,
    ) -> Result<Self, PaymentError> {
        let secret_key = secret_key.into();
        if secret_key.trim().is_empty() {
            return Err(PaymentError::Config("payment secret key is empty".into()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            secret_key,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            verifier,
        })
    }

    /// Make a form-encoded POST request.
    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
        idempotency_key: &str,
    ) -> Result<T, PaymentError> {
        let url = format!("{}{}", self.api_url, path);
        debug!(url = %url, idempotency_key = %idempotency_key, "POST request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", idempotency_key)
            .form(form)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Handle API response, converting errors appropriately.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: Response,
    ) -> Result<T, PaymentError> {
        let status = response.status();

        if status.is_success() {
            let text = response.text().await?;
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                PaymentError::Serialization(e)
            })
        } else {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .ok()
                .map(|env| match (env.error.kind, env.error.message) {
                    (Some(kind), Some(msg)) => format!("{kind}: {msg}"),
                    (None, Some(msg)) => msg,
                    (Some(kind), None) => kind,
                    (None, None) => text.clone(),
                })
                .unwrap_or(text);
            Err(PaymentError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(
        &self,
        amount: Amount,
        job_id: &str,
        idempotency_key: &str,
    ) -> Result<IntentHandle, PaymentError> {
        info!(job_id = %job_id, amount = %amount, "Creating payment intent");

        let form = [
            ("amount", amount.minor.to_string()),
            ("currency", amount.currency.code().to_string()),
            ("metadata[job_id]", job_id.to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];
        let intent: IntentResponse = self
            .post_form("/v1/payment_intents", &form, idempotency_key)
            .await?;

        info!(job_id = %job_id, intent_id = %intent.id, "Payment intent created");
        Ok(IntentHandle {
            intent_id: intent.id,
            client_secret: intent.client_secret,
        })
    }

    async fn refund(
        &self,
        intent_id: &str,
        amount: Amount,
        idempotency_key: &str,
    ) -> Result<RefundHandle, PaymentError> {
        info!(intent_id = %intent_id, amount = %amount, "Issuing refund");

        let form = [
            ("payment_intent", intent_id.to_string()),
            ("amount", amount.minor.to_string()),
        ];
        let refund: RefundResponse = self
            .post_form("/v1/refunds", &form, idempotency_key)
            .await?;

        Ok(RefundHandle {
            refund_id: refund.id,
            status: refund.status.unwrap_or_else(|| "pending".to_string()),
        })
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<ParsedEvent, SignatureError> {
        self.verifier.verify(payload, signature_header)
    }
}
