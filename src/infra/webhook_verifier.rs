//! Standard Webhooks signature verification for billing-provider deliveries.
//!
//! The provider signs `{webhook-id}.{webhook-timestamp}.{body}` with
//! HMAC-SHA256 and sends one or more `v1,<base64>` signatures, space
//! separated, in `webhook-signature`.

use axum::http::HeaderMap;
use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_ID_HEADER: &str = "webhook-id";
pub const WEBHOOK_TIMESTAMP_HEADER: &str = "webhook-timestamp";
pub const WEBHOOK_SIGNATURE_HEADER: &str = "webhook-signature";

const SECRET_PREFIX: &str = "whsec_";
const TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookVerifyError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid webhook timestamp")]
    InvalidTimestamp,

    #[error("webhook timestamp outside tolerance")]
    TimestampOutOfTolerance,

    #[error("webhook secret is not valid base64")]
    InvalidSecret,

    #[error("no matching signature")]
    SignatureMismatch,
}

pub struct WebhookVerifier {
    key: Vec<u8>,
}

impl WebhookVerifier {
    /// `whsec_`-prefixed secrets carry a base64 key; anything else is used
    /// as raw bytes.
    pub fn new(secret: &SecretString) -> Result<Self, WebhookVerifyError> {
        let secret = secret.expose_secret();
        let key = match secret.strip_prefix(SECRET_PREFIX) {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map_err(|_| WebhookVerifyError::InvalidSecret)?,
            None => secret.as_bytes().to_vec(),
        };
        Ok(Self { key })
    }

    /// Base64 signature of one delivery.
    pub fn sign(&self, msg_id: &str, timestamp: i64, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(msg_id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        STANDARD.encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, headers: &HeaderMap, body: &[u8], now: i64) -> Result<(), WebhookVerifyError> {
        let msg_id = header(headers, WEBHOOK_ID_HEADER)?;
        let timestamp: i64 = header(headers, WEBHOOK_TIMESTAMP_HEADER)?
            .trim()
            .parse()
            .map_err(|_| WebhookVerifyError::InvalidTimestamp)?;
        let signatures = header(headers, WEBHOOK_SIGNATURE_HEADER)?;

        let skew = now
            .checked_sub(timestamp)
            .map(i64::unsigned_abs)
            .ok_or(WebhookVerifyError::TimestampOutOfTolerance)?;
        if skew > TOLERANCE_SECS {
            return Err(WebhookVerifyError::TimestampOutOfTolerance);
        }

        let expected = self.sign(msg_id, timestamp, body);
        let matched = signatures
            .split_whitespace()
            .filter_map(|entry| entry.split_once(','))
            .filter(|(version, _)| *version == "v1")
            .any(|(_, sig)| constant_time_eq(sig.as_bytes(), expected.as_bytes()));

        if matched {
            Ok(())
        } else {
            Err(WebhookVerifyError::SignatureMismatch)
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookVerifyError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(WebhookVerifyError::MissingHeader(name))
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
