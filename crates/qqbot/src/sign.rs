//! Webhook signature handling.
//!
//! The platform signs `timestamp + body` with an ed25519 key whose seed is
//! the bot secret repeated to 32 bytes; the same derivation signs our side
//! of the callback-validation handshake (opcode 13).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};

/// Derive the deterministic signing key from the bot secret.
#[must_use]
pub fn signing_key(secret: &str) -> SigningKey {
    let mut seed = Vec::with_capacity(32);
    let bytes = secret.as_bytes();
    if bytes.is_empty() {
        return SigningKey::from_bytes(&[0u8; 32]);
    }
    while seed.len() < 32 {
        seed.extend_from_slice(bytes);
    }
    seed.truncate(32);
    let mut fixed = [0u8; 32];
    fixed.copy_from_slice(&seed);
    SigningKey::from_bytes(&fixed)
}

/// Verify `X-Signature-Ed25519` over `timestamp + body`.
#[must_use]
pub fn verify(secret: &str, signature_hex: &str, timestamp: &str, body: &[u8]) -> bool {
    let Ok(signature_bytes) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&signature_bytes) else {
        return false;
    };
    let key = signing_key(secret);
    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);
    key.verifying_key().verify(&message, &signature).is_ok()
}

/// Sign the opcode-13 validation challenge: `event_ts + plain_token`.
#[must_use]
pub fn sign_validation(secret: &str, event_ts: &str, plain_token: &str) -> String {
    let key = signing_key(secret);
    let mut message = Vec::with_capacity(event_ts.len() + plain_token.len());
    message.extend_from_slice(event_ts.as_bytes());
    message.extend_from_slice(plain_token.as_bytes());
    hex::encode(key.sign(&message).to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_derivation_is_deterministic() {
        let a = signing_key("secret");
        let b = signing_key("secret");
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_ne!(a.to_bytes(), signing_key("other").to_bytes());
    }

    #[test]
    fn platform_signature_round_trips() {
        let secret = "botsecret123";
        let key = signing_key(secret);
        let timestamp = "1700000000";
        let body = br#"{"op":0,"t":"C2C_MESSAGE_CREATE"}"#;
        let mut message = timestamp.as_bytes().to_vec();
        message.extend_from_slice(body);
        let signature = hex::encode(key.sign(&message).to_bytes());

        assert!(verify(secret, &signature, timestamp, body));
        assert!(!verify(secret, &signature, "1700000001", body));
        assert!(!verify("wrong", &signature, timestamp, body));
        assert!(!verify(secret, "zz-not-hex", timestamp, body));
    }

    #[test]
    fn validation_signature_verifies_against_own_key() {
        let secret = "botsecret123";
        let signature_hex = sign_validation(secret, "1700000000", "token-abc");
        let key = signing_key(secret);
        let signature =
            Signature::from_slice(&hex::decode(signature_hex).unwrap()).unwrap();
        key.verifying_key()
            .verify(b"1700000000token-abc", &signature)
            .unwrap();
    }
}
