use crate::error::SignatureError;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Verify an HMAC-SHA256 signature over the raw request body.
/// Accepts `sha256=<hex>` or bare `<hex>`. The digest is compared in
/// constant time via `Mac::verify_slice`.
pub fn verify(
    payload: &[u8],
    received_signature: Option<&str>,
    secret: Option<&str>,
) -> Result<(), SignatureError> {
    let secret = secret
        .filter(|s| !s.is_empty())
        .ok_or(SignatureError::MissingSecret)?;
    let received = received_signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SignatureError::MissingSignature)?;

    let hex_sig = received.strip_prefix(SIGNATURE_PREFIX).unwrap_or(received);
    let provided = hex::decode(hex_sig).map_err(|_| SignatureError::MalformedSignature)?;

    let mac = keyed_mac(secret).chain_update(payload);
    let expected_len = <Sha256 as sha2::Digest>::output_size();
    if provided.len() != expected_len {
        return Err(SignatureError::LengthMismatch {
            expected: expected_len,
            actual: provided.len(),
        });
    }

    mac.verify_slice(&provided)
        .map_err(|_| SignatureError::Mismatch)
}

/// Produce the `sha256=<hex>` signature for a payload. Used by the test
/// endpoint and replay tooling.
pub fn generate(payload: &[u8], secret: &str) -> String {
    let mac = keyed_mac(secret).chain_update(payload);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
}

/// Whether a header value looks like a SHA-256 hex signature, with or
/// without the `sha256=` prefix.
pub fn is_valid_format(signature: &str) -> bool {
    let hex_sig = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    hex_sig.len() == 64 && hex_sig.bytes().all(|b| b.is_ascii_hexdigit())
}

fn keyed_mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn generated_signature_verifies() {
        let payload = br#"{"event":"order.created"}"#;
        let sig = generate(payload, "secret");
        assert!(sig.starts_with("sha256="));
        assert_eq!(verify(payload, Some(&sig), Some("secret")), Ok(()));
    }

    #[test]
    fn accepts_bare_hex() {
        let payload = b"hello";
        let sig = generate(payload, "k");
        let bare = sig.strip_prefix("sha256=").unwrap();
        assert_eq!(verify(payload, Some(bare), Some("k")), Ok(()));
    }

    #[test]
    fn uppercase_hex_is_accepted() {
        let payload = b"hello";
        let sig = generate(payload, "k").to_uppercase().replace("SHA256=", "sha256=");
        assert_eq!(verify(payload, Some(&sig), Some("k")), Ok(()));
    }

    #[test]
    fn wrong_secret_is_mismatch() {
        let payload = b"payload";
        let sig = generate(payload, "right");
        assert_eq!(
            verify(payload, Some(&sig), Some("wrong")),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn reencoded_payload_fails() {
        let raw = br#"{"a": 1,  "b": 2}"#;
        let sig = generate(raw, "s");
        let reencoded = serde_json::to_vec(&serde_json::from_slice::<serde_json::Value>(raw).unwrap()).unwrap();
        assert_eq!(
            verify(&reencoded, Some(&sig), Some("s")),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn missing_inputs() {
        assert_eq!(verify(b"x", Some("sha256=00"), None), Err(SignatureError::MissingSecret));
        assert_eq!(verify(b"x", Some("sha256=00"), Some("")), Err(SignatureError::MissingSecret));
        assert_eq!(verify(b"x", None, Some("s")), Err(SignatureError::MissingSignature));
        assert_eq!(verify(b"x", Some("  "), Some("s")), Err(SignatureError::MissingSignature));
    }

    #[test]
    fn short_signature_is_length_mismatch() {
        assert_eq!(
            verify(b"x", Some("sha256=abcd"), Some("s")),
            Err(SignatureError::LengthMismatch { expected: 32, actual: 2 })
        );
    }

    #[test]
    fn long_signature_is_length_mismatch() {
        let sig = format!("{}00", generate(b"x", "s"));
        assert_eq!(
            verify(b"x", Some(&sig), Some("s")),
            Err(SignatureError::LengthMismatch { expected: 32, actual: 33 })
        );
    }

    #[test]
    fn non_hex_is_malformed() {
        assert_eq!(
            verify(b"x", Some("sha256=zzzz"), Some("s")),
            Err(SignatureError::MalformedSignature)
        );
    }

    #[test]
    fn format_check() {
        let sig = generate(b"p", "s");
        assert!(is_valid_format(&sig));
        assert!(is_valid_format(sig.strip_prefix("sha256=").unwrap()));
        assert!(!is_valid_format("sha256=abc"));
        assert!(!is_valid_format(&"g".repeat(64)));
    }

    proptest! {
        #[test]
        fn roundtrip_always_valid(payload in proptest::collection::vec(any::<u8>(), 0..512), secret in "[ -~]{1,64}") {
            let sig = generate(&payload, &secret);
            prop_assert_eq!(verify(&payload, Some(&sig), Some(&secret)), Ok(()));
        }

        #[test]
        fn single_bit_flip_rejected(
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            secret in "[a-z0-9]{1,32}",
            byte_idx in 0usize..32,
            bit in 0u8..8,
        ) {
            let sig = generate(&payload, &secret);
            let mut raw = hex::decode(sig.strip_prefix("sha256=").unwrap()).unwrap();
            raw[byte_idx] ^= 1 << bit;
            let mutated = format!("sha256={}", hex::encode(raw));
            prop_assert_eq!(verify(&payload, Some(&mutated), Some(&secret)), Err(SignatureError::Mismatch));
        }
    }
}
