use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Verify a `sha256=<hex>` HMAC header (GitHub `X-Hub-Signature-256`,
/// Bitbucket `X-Hub-Signature`) against the raw request body.
/// Comparison is constant-time via `Mac::verify_slice`.
pub fn verify_hmac_sha256(secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_sig) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig) = hex::decode(hex_sig) else {
        return false;
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(body);
    mac.verify_slice(&sig).is_ok()
}

/// Constant-time equality for GitLab's plain shared-token header
/// (`X-Gitlab-Token`). Both sides are MACed under a fixed key so the byte
/// comparison never touches the secrets directly.
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    let tag = |value: &str| {
        let mut mac =
            HmacSha256::new_from_slice(b"enclii.webhook.token.compare").expect("static key");
        mac.update(value.as_bytes());
        mac.finalize().into_bytes()
    };
    tag(expected) == tag(provided)
}

/// SHA-256 of the raw payload, stored on the delivery row for audit.
pub fn payload_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_accepted() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign("s3cret", body);
        assert!(verify_hmac_sha256("s3cret", body, &header));
    }

    #[test]
    fn wrong_secret_rejected() {
        let body = b"payload";
        let header = sign("s3cret", body);
        assert!(!verify_hmac_sha256("other", body, &header));
    }

    #[test]
    fn tampered_body_rejected() {
        let header = sign("s3cret", b"payload");
        assert!(!verify_hmac_sha256("s3cret", b"payload!", &header));
    }

    #[test]
    fn missing_prefix_rejected() {
        let body = b"payload";
        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(body);
        let bare = hex::encode(mac.finalize().into_bytes());
        assert!(!verify_hmac_sha256("s3cret", body, &bare));
    }

    #[test]
    fn non_hex_signature_rejected() {
        assert!(!verify_hmac_sha256("s3cret", b"payload", "sha256=zzzz"));
    }

    #[test]
    fn token_compare() {
        assert!(tokens_match("glpat-abc", "glpat-abc"));
        assert!(!tokens_match("glpat-abc", "glpat-abd"));
        assert!(!tokens_match("glpat-abc", ""));
    }

    #[test]
    fn payload_hash_is_stable_hex() {
        let h1 = payload_hash(b"x");
        let h2 = payload_hash(b"x");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, payload_hash(b"y"));
    }
}
