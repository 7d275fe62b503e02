//! HMAC-SHA256 signatures over the raw request body, hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Check `signature` (hex) against the HMAC of `payload` under `secret`.
///
/// An empty secret, an empty or non-hex signature, or a mismatch all verify
/// as `false`. The digest comparison is constant time.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let signature = signature.trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Hex HMAC of `payload`, as a sender would compute it.
pub fn sign(payload: &[u8], secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "webhook-secret";

    #[test]
    fn test_valid_signature() {
        let body = br#"{"id":"evt-1","type":"enrollment.created","data":{}}"#;
        let signature = sign(body, SECRET);
        assert!(verify_signature(body, &signature, SECRET));
        assert!(verify_signature(body, &signature.to_uppercase(), SECRET));
    }

    #[test]
    fn test_rejects_tampering_and_missing_inputs() {
        let body = br#"{"id":"evt-1"}"#;
        let signature = sign(body, SECRET);

        assert!(!verify_signature(br#"{"id":"evt-2"}"#, &signature, SECRET));
        assert!(!verify_signature(body, &signature, "other-secret"));
        assert!(!verify_signature(body, &signature, ""));
        assert!(!verify_signature(body, "", SECRET));
        assert!(!verify_signature(body, "not-hex", SECRET));
        assert!(!verify_signature(body, &signature[..10], SECRET));
    }
}
