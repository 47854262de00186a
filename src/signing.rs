// Shared HMAC-SHA256 signing routine used by both pagination cursors (§4.C)
// and batch confirm tokens (§4.G) — "Signature = first 16 hex chars of
// SHA-256(canonical-JSON(payload) + server-secret)" (§6). Keeping both
// signers behind one function means there is a single place that touches
// the process secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Returns the first 16 hex characters of HMAC-SHA256(secret, payload).
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    hex::encode(&digest[..8])
}

pub fn verify(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let expected = sign(secret, payload);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic() {
        let secret = b"secret-key";
        let payload = b"payload-bytes";
        assert_eq!(sign(secret, payload), sign(secret, payload));
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let secret = b"secret-key";
        let sig = sign(secret, b"original");
        assert!(!verify(secret, b"tampered", &sig));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let sig = sign(b"secret-a", b"payload");
        assert!(!verify(b"secret-b", b"payload", &sig));
    }

    #[test]
    fn signature_is_sixteen_hex_chars() {
        let sig = sign(b"k", b"v");
        assert_eq!(sig.len(), 16);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
