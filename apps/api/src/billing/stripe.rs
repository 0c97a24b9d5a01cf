//! Stripe client: webhook signature verification and checkout session retrieval.
//!
//! This is the only module that talks to the Stripe API. Retrieval retries on
//! 429 / 5xx and transport errors with exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::AppError;

const STRIPE_API_URL: &str = "https://api.stripe.com";
const MAX_RETRIES: u32 = 3;
/// Maximum age (either direction) of a webhook signature timestamp, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const ASYNC_PAYMENT_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const ASYNC_PAYMENT_FAILED: &str = "checkout.session.async_payment_failed";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum StripeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Stripe API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Malformed stripe-signature header: {0}")]
    MalformedSignature(&'static str),

    #[error("Webhook signature does not match payload")]
    SignatureMismatch,

    #[error("Webhook timestamp outside tolerance")]
    StaleTimestamp,

    #[error("Invalid checkout session id '{0}'")]
    InvalidSessionId(String),

    #[error("Checkout session '{0}' not found")]
    SessionNotFound(String),
}

impl From<StripeError> for AppError {
    fn from(e: StripeError) -> Self {
        match e {
            StripeError::InvalidSessionId(_) => AppError::Validation(e.to_string()),
            StripeError::SessionNotFound(_) => AppError::NotFound(e.to_string()),
            StripeError::MalformedSignature(_)
            | StripeError::SignatureMismatch
            | StripeError::StaleTimestamp => AppError::Validation(e.to_string()),
            other => AppError::Payment(other.to_string()),
        }
    }
}

/// Contact details Stripe collected at checkout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

/// The subset of a Stripe Checkout Session the fulfillment path reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

impl WebhookEvent {
    pub fn checkout_session(&self) -> Result<CheckoutSession, StripeError> {
        Ok(serde_json::from_value(self.data.object.clone())?)
    }
}

/// Checks a `stripe-signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against the raw body.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), StripeError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse()
                        .map_err(|_| StripeError::MalformedSignature("timestamp is not a number"))?,
                )
            }
            // Undecodable candidates are skipped; another v1 may still match.
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(StripeError::MalformedSignature("missing timestamp"))?;
    if signatures.is_empty() {
        return Err(StripeError::MalformedSignature("missing v1 signature"));
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(StripeError::StaleTimestamp);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| StripeError::MalformedSignature("unusable webhook secret"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    // verify_slice compares in constant time.
    if signatures
        .iter()
        .any(|candidate| mac.clone().verify_slice(candidate).is_ok())
    {
        Ok(())
    } else {
        Err(StripeError::SignatureMismatch)
    }
}

/// Verifies the signature, then parses the event.
pub fn construct_event(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<WebhookEvent, StripeError> {
    verify_signature(payload, header, secret, now)?;
    Ok(serde_json::from_slice(payload)?)
}

pub fn validate_session_id(session_id: &str) -> Result<(), StripeError> {
    let valid = session_id.starts_with("cs_")
        && session_id.len() <= 255
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StripeError::InvalidSessionId(session_id.to_string()))
    }
}

#[async_trait]
pub trait CheckoutSessions: Send + Sync {
    async fn retrieve(&self, session_id: &str) -> Result<CheckoutSession, StripeError>;
}

#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    secret_key: String,
    base_url: String,
}

impl StripeClient {
    pub fn new(secret_key: String) -> Result<Self, StripeError> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            secret_key,
            base_url: STRIPE_API_URL.to_string(),
        })
    }

    fn session_url(&self, session_id: &str) -> String {
        format!("{}/v1/checkout/sessions/{session_id}", self.base_url)
    }
}

#[async_trait]
impl CheckoutSessions for StripeClient {
    async fn retrieve(&self, session_id: &str) -> Result<CheckoutSession, StripeError> {
        validate_session_id(session_id)?;
        let url = self.session_url(session_id);
        let mut last_error: Option<StripeError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "Stripe session fetch attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = match self
                .client
                .get(&url)
                .bearer_auth(&self.secret_key)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(StripeError::Http(e));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                last_error = Some(StripeError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }
            if status.as_u16() == 404 {
                return Err(StripeError::SessionNotFound(session_id.to_string()));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(StripeError::Api {
                    status: status.as_u16(),
                    message: body,
                });
            }

            let session: CheckoutSession = response.json().await?;
            debug!(session_id, paid = session.is_paid(), "Checkout session retrieved");
            return Ok(session);
        }

        Err(last_error.unwrap_or(StripeError::Api {
            status: 0,
            message: format!("gave up after {MAX_RETRIES} attempts"),
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::sign;
    use super::*;

    const SECRET: &str = "whsec_test123secret456";
    const NOW: i64 = 1_700_000_000;
    const PAYLOAD: &[u8] = b"{\"type\":\"checkout.session.completed\"}";

    #[test]
    fn test_valid_signature_accepted() {
        let header = sign(PAYLOAD, SECRET, NOW);
        assert!(verify_signature(PAYLOAD, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign(PAYLOAD, "wrong_secret", NOW);
        assert!(matches!(
            verify_signature(PAYLOAD, &header, SECRET, NOW),
            Err(StripeError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_modified_payload_rejected() {
        let header = sign(PAYLOAD, SECRET, NOW);
        let tampered = b"{\"type\":\"checkout.session.completed\",\"hacked\":true}";
        assert!(matches!(
            verify_signature(tampered, &header, SECRET, NOW),
            Err(StripeError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_timestamp_tolerance() {
        let header = sign(PAYLOAD, SECRET, NOW - 600);
        assert!(matches!(
            verify_signature(PAYLOAD, &header, SECRET, NOW),
            Err(StripeError::StaleTimestamp)
        ));
        let header = sign(PAYLOAD, SECRET, NOW - SIGNATURE_TOLERANCE_SECS);
        assert!(verify_signature(PAYLOAD, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn test_any_v1_may_match() {
        let valid = sign(PAYLOAD, SECRET, NOW);
        let v1 = valid.split_once(",v1=").unwrap().1;
        let header = format!("t={NOW},v1=deadbeef,v1={v1}");
        assert!(verify_signature(PAYLOAD, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn test_malformed_headers() {
        for header in ["", "garbage", "v1=abcdef", "t=1700000000", "t=soon,v1=abcdef"] {
            assert!(
                matches!(
                    verify_signature(PAYLOAD, header, SECRET, NOW),
                    Err(StripeError::MalformedSignature(_))
                ),
                "header {header:?} should be malformed"
            );
        }
    }

    #[test]
    fn test_construct_event_reads_session() {
        let payload = serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_test_123",
                "payment_status": "paid",
                "amount_total": 1400,
                "metadata": {"userId": "abc"}
            }}
        }))
        .unwrap();
        let header = sign(&payload, SECRET, NOW);

        let event = construct_event(&payload, &header, SECRET, NOW).unwrap();
        assert_eq!(event.kind, CHECKOUT_COMPLETED);
        let session = event.checkout_session().unwrap();
        assert!(session.is_paid());
        assert_eq!(session.amount_total, Some(1400));
        assert_eq!(session.metadata.get("userId").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("cs_test_a1B2c3").is_ok());
        assert!(validate_session_id("pi_123").is_err());
        assert!(validate_session_id("cs_test/../../v1/charges").is_err());
    }
}
