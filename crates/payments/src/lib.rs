//! Payment gateway client for LoRA training jobs.
//!
//! Creates payment intents and refunds (both keyed by idempotency keys) and
//! turns inbound webhook deliveries into verified [`ParsedEvent`]s. The crate
//! only reports what the payment provider says; deciding what an event means
//! for a job is left to the orchestrator.
//!
//! ## Example
//!
//! ```ignore
//! use forge_payments::{Amount, PaymentGateway, StripeGateway, WebhookVerifier};
//!
//! let gateway = StripeGateway::new(secret_key, WebhookVerifier::new(webhook_secret))?;
//! let intent = gateway.create_intent(Amount::usd(1500), "job-1", "intent-job-1-1").await?;
//!
//! // Later, in the webhook handler:
//! let event = gateway.verify_webhook(&body, signature_header)?;
//! ```

pub mod client;
pub mod error;
pub mod money;
pub mod webhook;

pub use client::{IntentHandle, PaymentGateway, RefundHandle, StripeGateway};
pub use error::{PaymentError, SignatureError};
pub use money::{Amount, Currency};
pub use webhook::{ParsedEvent, PaymentEventKind, WebhookVerifier};
