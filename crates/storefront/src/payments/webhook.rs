//! Webhook authentication and event decoding.
//!
//! Deliveries carry a `Stripe-Signature: t=<unix>,v1=<hex>` header where the
//! signature is HMAC-SHA256 over `"{t}.{body}"` with the endpoint secret.

use std::time::Duration;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use super::{PaymentError, ProviderSession};
use crate::config::PaymentConfig;

/// Name of the signature header.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Checks webhook signatures against the endpoint secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: SecretString,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"[REDACTED]")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookVerifier {
    /// Create a verifier.
    #[must_use]
    pub const fn new(secret: SecretString, tolerance: Duration) -> Self {
        Self { secret, tolerance }
    }

    /// Create a verifier from payment configuration.
    #[must_use]
    pub fn from_config(config: &PaymentConfig) -> Self {
        Self::new(config.webhook_secret.clone(), config.webhook_tolerance)
    }

    /// Verify a delivery against the current time.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::InvalidSignature` if the header is malformed,
    /// the timestamp is outside the tolerance, or no signature matches.
    pub fn verify(&self, payload: &[u8], header: &str) -> Result<(), PaymentError> {
        self.verify_at(payload, header, chrono::Utc::now().timestamp())
    }

    /// Verify a delivery as of `now` (unix seconds).
    ///
    /// # Errors
    ///
    /// See [`Self::verify`].
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<(), PaymentError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp =
            timestamp.ok_or_else(|| PaymentError::InvalidSignature("missing timestamp".to_string()))?;
        if signatures.is_empty() {
            return Err(PaymentError::InvalidSignature(
                "missing v1 signature".to_string(),
            ));
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| PaymentError::InvalidSignature("invalid timestamp".to_string()))?;
        if now.abs_diff(ts) > self.tolerance.as_secs() {
            return Err(PaymentError::InvalidSignature(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| PaymentError::InvalidSignature(e.to_string()))?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());

        if !signatures
            .iter()
            .any(|candidate| constant_time_compare(&expected, candidate))
        {
            return Err(PaymentError::InvalidSignature(
                "signature mismatch".to_string(),
            ));
        }

        debug!("webhook signature verified");
        Ok(())
    }
}

/// Compare two strings without short-circuiting on the first difference.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}

/// The provider events the pipeline acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// `checkout.session.completed`
    CheckoutCompleted(ProviderSession),
    /// `payment_intent.succeeded`
    PaymentIntentSucceeded {
        intent_id: String,
        latest_charge: Option<String>,
    },
    /// `charge.failed`
    ChargeFailed {
        charge_id: String,
        failure_message: Option<String>,
    },
    /// Any other event type.
    Unknown,
}

/// A decoded webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: String,
    pub kind: String,
    pub event: ProviderEvent,
    /// The full body, kept for the payment log.
    pub raw: serde_json::Value,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct IntentObject {
    id: String,
    latest_charge: Option<String>,
}

#[derive(Deserialize)]
struct ChargeObject {
    id: String,
    failure_message: Option<String>,
}

impl WebhookEvent {
    /// Decode a verified webhook body.
    ///
    /// # Errors
    ///
    /// Returns `PaymentError::InvalidPayload` if the body is not an event or
    /// a known event's object has the wrong shape.
    pub fn parse(payload: &[u8]) -> Result<Self, PaymentError> {
        let raw: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;
        let envelope: Envelope = serde_json::from_value(raw.clone())
            .map_err(|e| PaymentError::InvalidPayload(e.to_string()))?;

        let object = envelope.data.object;
        let invalid = |e: serde_json::Error| PaymentError::InvalidPayload(e.to_string());
        let event = match envelope.kind.as_str() {
            "checkout.session.completed" => {
                ProviderEvent::CheckoutCompleted(serde_json::from_value(object).map_err(invalid)?)
            }
            "payment_intent.succeeded" => {
                let intent: IntentObject = serde_json::from_value(object).map_err(invalid)?;
                ProviderEvent::PaymentIntentSucceeded {
                    intent_id: intent.id,
                    latest_charge: intent.latest_charge,
                }
            }
            "charge.failed" => {
                let charge: ChargeObject = serde_json::from_value(object).map_err(invalid)?;
                ProviderEvent::ChargeFailed {
                    charge_id: charge.id,
                    failure_message: charge.failure_message,
                }
            }
            _ => ProviderEvent::Unknown,
        };

        Ok(Self {
            id: envelope.id,
            kind: envelope.kind,
            event,
            raw,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    const SECRET: &str = "whsec_test123secret456";

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(SecretString::from(SECRET), Duration::from_secs(300))
    }

    #[test]
    fn test_valid_signature() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let header = sign(payload, 1_700_000_000);
        assert!(verifier().verify_at(payload, &header, 1_700_000_010).is_ok());
    }

    #[test]
    fn test_modified_payload_is_rejected() {
        let header = sign(br#"{"type":"a"}"#, 1_700_000_000);
        let result = verifier().verify_at(br#"{"type":"b"}"#, &header, 1_700_000_000);
        assert!(matches!(result, Err(PaymentError::InvalidSignature(_))));
    }

    #[test]
    fn test_old_timestamp_is_rejected() {
        let payload = b"{}";
        let header = sign(payload, 1_700_000_000);
        let result = verifier().verify_at(payload, &header, 1_700_000_000 + 600);
        assert!(matches!(result, Err(PaymentError::InvalidSignature(_))));
    }

    #[test]
    fn test_malformed_headers() {
        let v = verifier();
        for header in ["", "garbage", "t=1700000000", "v1=abc", "t=soon,v1=abc"] {
            assert!(
                v.verify_at(b"{}", header, 1_700_000_000).is_err(),
                "header {header:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_any_matching_v1_is_accepted() {
        let payload = b"{}";
        let good = sign(payload, 1_700_000_000);
        let header = format!("{good},v1=deadbeef");
        assert!(verifier().verify_at(payload, &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_parse_checkout_completed() {
        let body = br#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_test_1",
                "payment_status": "paid",
                "payment_intent": "pi_1",
                "amount_total": 2599,
                "customer_details": {"email": "buyer@example.com", "name": "Ada"},
                "metadata": {"user_id": "5", "cart_id": "9"}
            }}
        }"#;
        let event = WebhookEvent::parse(body).unwrap();
        let ProviderEvent::CheckoutCompleted(session) = event.event else {
            panic!("expected checkout completed");
        };
        assert_eq!(session.id, "cs_test_1");
        assert!(session.is_paid());
        assert_eq!(session.email(), Some("buyer@example.com"));
        assert_eq!(session.amount(), Some(Decimal::new(2599, 2)));
        assert_eq!(session.metadata.get("cart_id").map(String::as_str), Some("9"));
    }

    #[test]
    fn test_parse_charge_failed_and_unknown() {
        let body = br#"{"id":"evt_2","type":"charge.failed",
            "data":{"object":{"id":"ch_1","failure_message":"card declined"}}}"#;
        assert_eq!(
            WebhookEvent::parse(body).unwrap().event,
            ProviderEvent::ChargeFailed {
                charge_id: "ch_1".to_string(),
                failure_message: Some("card declined".to_string()),
            }
        );

        let body = br#"{"id":"evt_3","type":"customer.created","data":{"object":{}}}"#;
        assert_eq!(WebhookEvent::parse(body).unwrap().event, ProviderEvent::Unknown);
    }

    #[test]
    fn test_parse_rejects_non_events() {
        assert!(matches!(
            WebhookEvent::parse(b"not json"),
            Err(PaymentError::InvalidPayload(_))
        ));
        assert!(matches!(
            WebhookEvent::parse(br#"{"type":"charge.failed","data":{"object":{}}}"#),
            Err(PaymentError::InvalidPayload(_))
        ));
    }
}
