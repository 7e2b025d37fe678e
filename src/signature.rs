//! Webhook signature verification.
//!
//! The provider signs each delivery with HMAC-SHA256 over the raw request
//! body and sends the digest as `X-Hub-Signature-256: sha256=<hex>`. The
//! digest must be computed over the exact bytes received — re-serializing the
//! JSON can change the byte stream and break the comparison.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    MissingHeader,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verify a `sha256=<hex>` HMAC-SHA256 signature header against `body`.
///
/// `header_value` is the raw header value as received. Comparison is
/// constant-time over the full tagged string, so a missing or wrong
/// `sha256=` prefix fails the same way a wrong digest does.
pub fn verify_signature(
    body: &[u8],
    header_value: Option<&str>,
    secret: &str,
) -> Result<(), SignatureError> {
    let provided = header_value.ok_or(SignatureError::MissingHeader)?;
    let expected = format!("sha256={}", compute_hmac(body, secret));
    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err(SignatureError::Mismatch);
    }
    Ok(())
}

/// Hex-encoded HMAC-SHA256 of `body` keyed by `secret`.
pub fn compute_hmac(body: &[u8], secret: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
