//! Inbound delivery-event payloads and signature verification.
//!
//! The mail API reports per-message delivery events (delivered, opened,
//! bounced, ...) to a webhook endpoint. Payloads are authenticated with an
//! HMAC-SHA256 signature over the raw request body, base64-encoded in a
//! header. Events must never be trusted before verification.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// A delivery event as reported by the mail API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    /// The API's message identifier, matching a submission receipt.
    pub external_id: String,
    /// Event kind (e.g., "delivered", "opened", "bounced").
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event occurred, per the mail API's clock.
    pub timestamp: DateTime<Utc>,
    /// Provider-specific extras (bounce codes, user agent, ...).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Verifies the HMAC-SHA256 signature of a raw webhook body.
///
/// # Errors
///
/// Returns [`Error::UnauthorizedEvent`] if the signature is malformed or
/// does not match.
pub fn verify_signature(secret: &[u8], body: &[u8], signature_b64: &str) -> Result<()> {
    let signature = STANDARD
        .decode(signature_b64)
        .map_err(|_| Error::UnauthorizedEvent("signature is not valid base64".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| Error::UnauthorizedEvent("invalid signing key".into()))?;
    mac.update(body);
    // verify_slice is constant-time
    mac.verify_slice(&signature)
        .map_err(|_| Error::UnauthorizedEvent("signature mismatch".into()))
}

/// Computes the base64 HMAC-SHA256 signature for a body.
///
/// Used by tests and by callers that need to simulate the provider.
///
/// # Errors
///
/// Returns an error if the key is unusable.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| Error::UnauthorizedEvent("invalid signing key".into()))?;
    mac.update(body);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Parses a verified webhook body into an [`EventPayload`].
///
/// # Errors
///
/// Returns [`Error::Payload`] if the body is not a valid event.
pub fn parse_event(body: &[u8]) -> Result<EventPayload> {
    Ok(serde_json::from_slice(body)?)
}
