//! Webhook signature verification
//!
//! The processor signs every delivery with a hex HMAC-SHA512 of the raw body,
//! keyed by the account's secret, and sends it in `x-paystack-signature`.

use hmac::{Hmac, Mac};
use sha2::Sha512;
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Missing webhook signature")]
    Missing,

    #[error("Webhook signature is not valid hex")]
    Malformed,

    #[error("Webhook signature does not match payload")]
    Mismatch,

    #[error("Webhook secret is not configured")]
    NoSecret,
}

/// Check `signature` against the raw request body
pub fn verify_signature(
    raw_body: &[u8],
    signature: Option<&str>,
    secret: &str,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::NoSecret);
    }

    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SignatureError::Missing)?;
    let received = hex::decode(signature).map_err(|_| SignatureError::Malformed)?;

    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::NoSecret)?;
    mac.update(raw_body);

    // constant-time comparison
    mac.verify_slice(&received)
        .map_err(|_| SignatureError::Mismatch)
}

/// Hex signature for a payload, as the processor would compute it
pub fn sign_payload(raw_body: &[u8], secret: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac key of any size is valid"));
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "sk_test_webhook";
    const BODY: &[u8] = br#"{"event":"transfer.success","data":{"reference":"po_1"}}"#;

    #[test]
    fn test_valid_signature() {
        let signature = sign_payload(BODY, SECRET);
        assert_eq!(signature.len(), 128);
        assert_eq!(verify_signature(BODY, Some(&signature), SECRET), Ok(()));
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let signature = sign_payload(BODY, SECRET);
        let tampered = br#"{"event":"transfer.success","data":{"reference":"po_2"}}"#;
        assert_eq!(
            verify_signature(tampered, Some(&signature), SECRET),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let signature = sign_payload(BODY, "sk_test_other");
        assert_eq!(
            verify_signature(BODY, Some(&signature), SECRET),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_missing_or_malformed_signature() {
        assert_eq!(
            verify_signature(BODY, None, SECRET),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_signature(BODY, Some("not-hex"), SECRET),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_fails_closed_without_secret() {
        let signature = sign_payload(BODY, SECRET);
        assert_eq!(
            verify_signature(BODY, Some(&signature), ""),
            Err(SignatureError::NoSecret)
        );
    }
}
