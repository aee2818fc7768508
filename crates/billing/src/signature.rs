//! Webhook signature verification
//!
//! The provider signs `"{timestamp}.{raw_body}"` with HMAC-SHA256 using the
//! endpoint's signing secret and sends `t=<timestamp>,v1=<hex>` in the
//! `Stripe-Signature` header. Several `v1` entries may be present while a
//! secret is being rolled.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Default replay window in seconds
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Parsed `Stripe-Signature` header
#[derive(Debug, PartialEq, Eq)]
struct SignatureHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> BillingResult<SignatureHeader> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value.to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(SignatureHeader {
        timestamp,
        signatures,
    })
}

/// Verifies inbound webhook payloads against the endpoint signing secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"[redacted]")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    /// Verify against the current wall clock
    pub fn verify(&self, payload: &[u8], header: &str) -> BillingResult<()> {
        self.verify_at(payload, header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verify as if the current time were `now` (unix seconds)
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> BillingResult<()> {
        let parsed = parse_signature_header(header)?;

        let age = now.checked_sub(parsed.timestamp).map(i64::unsigned_abs);
        let tolerance = self.tolerance_secs.unsigned_abs();
        if !matches!(age, Some(age) if age <= tolerance) {
            tracing::warn!(
                timestamp = parsed.timestamp,
                now,
                diff = ?age,
                "Webhook timestamp outside tolerance window"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = self.compute(payload, parsed.timestamp)?;

        let matched = parsed.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| bool::from(bytes.ct_eq(&expected)))
                .unwrap_or(false)
        });

        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        Ok(())
    }

    /// Build a header value for `payload` signed at `timestamp`.
    ///
    /// Used by tooling that replays captured events against a local endpoint.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> BillingResult<String> {
        let signature = hex::encode(self.compute(payload, timestamp)?);
        Ok(format!("t={},v1={}", timestamp, signature))
    }

    fn compute(&self, payload: &[u8], timestamp: i64) -> BillingResult<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
