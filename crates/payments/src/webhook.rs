//! Webhook signature verification and event parsing.
//!
//! Deliveries carry a `t=<unix seconds>,v1=<hex>` header. The signature is an
//! HMAC-SHA256 over `"{t}.{raw body}"` keyed with the endpoint secret. Several
//! `v1` entries may be present while a secret is being rolled.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

/// Default timestamp tolerance in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Kind of payment event the orchestrator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEventKind {
    /// `payment_intent.succeeded`
    IntentSucceeded,
    /// `payment_intent.payment_failed`
    IntentPaymentFailed,
    /// `payment_intent.canceled`
    IntentCanceled,
    /// `charge.refunded`
    ChargeRefunded,
    /// Any other event type; recorded but not acted upon.
    Other(String),
}

impl PaymentEventKind {
    /// Map a provider event type string.
    #[must_use]
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "payment_intent.succeeded" => Self::IntentSucceeded,
            "payment_intent.payment_failed" => Self::IntentPaymentFailed,
            "payment_intent.canceled" => Self::IntentCanceled,
            "charge.refunded" => Self::ChargeRefunded,
            other => Self::Other(other.to_string()),
        }
    }

    /// The provider event type string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::IntentSucceeded => "payment_intent.succeeded",
            Self::IntentPaymentFailed => "payment_intent.payment_failed",
            Self::IntentCanceled => "payment_intent.canceled",
            Self::ChargeRefunded => "charge.refunded",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for PaymentEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified payment event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    /// Provider-assigned unique event id (deduplication key).
    pub id: String,
    /// Event kind.
    pub kind: PaymentEventKind,
    /// Payment intent the event refers to.
    pub intent_id: Option<String>,
    /// Job id from the intent metadata.
    pub job_id: Option<String>,
    /// Amount in minor units, when present.
    pub amount: Option<i64>,
    /// When the provider created the event.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    data: Option<RawEventData>,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

/// Verifies webhook deliveries against the endpoint secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    /// Create a verifier with the default tolerance.
    ///
    /// A verifier built with an empty secret refuses every delivery.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    /// Set the timestamp tolerance.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// Verify a delivery and parse its event.
    pub fn verify(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
    ) -> Result<ParsedEvent, SignatureError> {
        self.verify_at(payload, signature_header, Utc::now())
    }

    /// Verify a delivery as of `now`.
    pub fn verify_at(
        &self,
        payload: &[u8],
        signature_header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ParsedEvent, SignatureError> {
        if !self.is_configured() {
            return Err(SignatureError::Unconfigured);
        }
        let header = signature_header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(SignatureError::Missing)?;

        let (timestamp, signatures) = parse_header(header)?;

        let age_secs = now.timestamp() - timestamp;
        if age_secs.abs() > self.tolerance_secs {
            return Err(SignatureError::Stale { age_secs });
        }

        let expected = self.compute(timestamp, payload);
        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| bool::from(expected.as_slice().ct_eq(&bytes)))
                .unwrap_or(false)
        });
        if !matched {
            return Err(SignatureError::Mismatch);
        }

        parse_event(payload)
    }

    /// Whether a non-empty secret is set.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.secret.trim().is_empty()
    }

    /// Build a signature header for `payload` at `timestamp`.
    #[must_use]
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> String {
        format!("t={timestamp},v1={}", hex::encode(self.compute(timestamp, payload)))
    }

    fn compute(&self, timestamp: i64, payload: &[u8]) -> Vec<u8> {
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
            return Vec::new();
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

fn parse_header(header: &str) -> Result<(i64, Vec<&str>), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            return Err(SignatureError::Malformed(format!("bad element `{part}`")));
        };
        match key {
            "t" => {
                let t = value
                    .parse::<i64>()
                    .map_err(|_| SignatureError::Malformed(format!("bad timestamp `{value}`")))?;
                timestamp = Some(t);
            }
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| SignatureError::Malformed("no timestamp".into()))?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed("no v1 signature".into()));
    }
    Ok((timestamp, signatures))
}

fn parse_event(payload: &[u8]) -> Result<ParsedEvent, SignatureError> {
    let raw: RawEvent =
        serde_json::from_slice(payload).map_err(|e| SignatureError::Payload(e.to_string()))?;

    let object = raw.data.map(|d| d.object).unwrap_or(Value::Null);
    let object_type = object.get("object").and_then(Value::as_str);

    // Charges point back to their intent; intents carry their own id.
    let intent_id = match object_type {
        Some("charge" | "refund") => object.get("payment_intent").and_then(Value::as_str),
        _ => object.get("id").and_then(Value::as_str),
    }
    .map(String::from);

    let job_id = object
        .get("metadata")
        .and_then(|m| m.get("job_id"))
        .and_then(Value::as_str)
        .map(String::from);

    let amount = match object_type {
        Some("charge") => object.get("amount_refunded").and_then(Value::as_i64),
        _ => object.get("amount").and_then(Value::as_i64),
    };

    let created_at = Utc
        .timestamp_opt(raw.created, 0)
        .single()
        .unwrap_or_default();

    Ok(ParsedEvent {
        id: raw.id,
        kind: PaymentEventKind::from_type(&raw.event_type),
        intent_id,
        job_id,
        amount,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn event_body() -> Vec<u8> {
        serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "pi_1",
                "object": "payment_intent",
                "amount": 1500,
                "currency": "usd",
                "metadata": { "job_id": "job-42" }
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[test]
    fn test_valid_signature_parses_event() {
        let verifier = WebhookVerifier::new(SECRET);
        let body = event_body();
        let header = verifier.sign(1_700_000_000, &body);

        let event = verifier
            .verify_at(&body, Some(&header), at(1_700_000_010))
            .unwrap();

        assert_eq!(event.id, "evt_1");
        assert_eq!(event.kind, PaymentEventKind::IntentSucceeded);
        assert_eq!(event.intent_id.as_deref(), Some("pi_1"));
        assert_eq!(event.job_id.as_deref(), Some("job-42"));
        assert_eq!(event.amount, Some(1500));
        assert_eq!(event.created_at, at(1_700_000_000));
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let header = verifier.sign(1_700_000_000, &event_body());
        let tampered = String::from_utf8(event_body())
            .unwrap()
            .replace("1500", "1");

        assert_eq!(
            verifier.verify_at(tampered.as_bytes(), Some(&header), at(1_700_000_000)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let body = event_body();
        let header = WebhookVerifier::new("whsec_other").sign(1_700_000_000, &body);

        assert_eq!(
            WebhookVerifier::new(SECRET).verify_at(&body, Some(&header), at(1_700_000_000)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET);
        let body = event_body();
        let header = verifier.sign(1_700_000_000, &body);

        assert_eq!(
            verifier.verify_at(&body, Some(&header), at(1_700_000_301)),
            Err(SignatureError::Stale { age_secs: 301 })
        );
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        let verifier = WebhookVerifier::new(SECRET);
        let body = event_body();
        let now = at(1_700_000_000);

        assert_eq!(verifier.verify_at(&body, None, now), Err(SignatureError::Missing));
        assert_eq!(verifier.verify_at(&body, Some("  "), now), Err(SignatureError::Missing));
        assert!(matches!(
            verifier.verify_at(&body, Some("v1=abcd"), now),
            Err(SignatureError::Malformed(_))
        ));
        assert!(matches!(
            verifier.verify_at(&body, Some("t=1700000000"), now),
            Err(SignatureError::Malformed(_))
        ));
        assert!(matches!(
            verifier.verify_at(&body, Some("t=soon,v1=abcd"), now),
            Err(SignatureError::Malformed(_))
        ));
    }

    #[test]
    fn test_any_matching_v1_entry_is_accepted() {
        let verifier = WebhookVerifier::new(SECRET);
        let body = event_body();
        let good = verifier.sign(1_700_000_000, &body);
        let good_sig = good.split_once("v1=").unwrap().1;
        let header = format!("t=1700000000,v1=deadbeef,v0=ignored,v1={good_sig}");

        assert!(verifier.verify_at(&body, Some(&header), at(1_700_000_000)).is_ok());
    }

    #[test]
    fn test_charge_event_points_at_intent() {
        let verifier = WebhookVerifier::new(SECRET);
        let body = serde_json::json!({
            "id": "evt_2",
            "type": "charge.refunded",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "ch_1",
                "object": "charge",
                "payment_intent": "pi_1",
                "amount": 1500,
                "amount_refunded": 1500
            }}
        })
        .to_string();
        let header = verifier.sign(1_700_000_000, body.as_bytes());

        let event = verifier
            .verify_at(body.as_bytes(), Some(&header), at(1_700_000_000))
            .unwrap();
        assert_eq!(event.kind, PaymentEventKind::ChargeRefunded);
        assert_eq!(event.intent_id.as_deref(), Some("pi_1"));
        assert_eq!(event.amount, Some(1500));
    }

    #[test]
    fn test_empty_secret_refuses_everything() {
        let verifier = WebhookVerifier::new("");
        assert!(!verifier.is_configured());
        let body = event_body();
        // HMAC accepts an empty key, so this header is self-consistent.
        let header = verifier.sign(1_700_000_000, &body);

        assert_eq!(
            verifier.verify_at(&body, Some(&header), at(1_700_000_000)),
            Err(SignatureError::Unconfigured)
        );
        assert_eq!(
            WebhookVerifier::new("   ").verify_at(&body, Some(&header), at(1_700_000_000)),
            Err(SignatureError::Unconfigured)
        );
    }

    #[test]
    fn test_unknown_event_types_are_kept() {
        assert_eq!(
            PaymentEventKind::from_type("customer.created"),
            PaymentEventKind::Other("customer.created".into())
        );
        assert_eq!(PaymentEventKind::IntentCanceled.to_string(), "payment_intent.canceled");
    }
}
