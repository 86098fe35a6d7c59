//! Payment gateway errors.

use thiserror::Error;

/// Errors that can occur during payment gateway operations.
#[derive(Error, Debug)]
pub enum PaymentError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PaymentError {
    /// Whether retrying the same request (with the same idempotency key) may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Api { status, .. } => *status >= 500 || *status == 429 || *status == 409,
            Self::Config(_) | Self::Serialization(_) => false,
        }
    }
}

/// Reasons a webhook delivery is rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// No endpoint secret is configured; nothing can be verified.
    #[error("webhook secret is not configured")]
    Unconfigured,

    /// No signature header was sent.
    #[error("missing signature header")]
    Missing,

    /// The header could not be parsed.
    #[error("malformed signature header: {0}")]
    Malformed(String),

    /// No signature in the header matches the payload.
    #[error("signature mismatch")]
    Mismatch,

    /// The signed timestamp is outside the tolerance window.
    #[error("signature timestamp is {age_secs}s away from now")]
    Stale { age_secs: i64 },

    /// The signature is valid but the payload is not an event.
    #[error("invalid event payload: {0}")]
    Payload(String),
}
