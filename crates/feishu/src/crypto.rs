//! Encrypted event decryption.
//!
//! Feishu derives the AES-256 key as SHA-256 of the configured encrypt
//! key; the IV is the first 16 bytes of the base64-decoded ciphertext and
//! the padding is standard PKCS#7.

use {
    aes::Aes256,
    base64::Engine,
    cbc::cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7},
    sha2::{Digest, Sha256},
};

use qiao_channels::{Error, Result};

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Decrypt the `encrypt` field of an event envelope to its JSON text.
pub fn decrypt_event(encrypt: &str, encrypt_key: &str) -> Result<String> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encrypt.trim())
        .map_err(|_| Error::BadPadding)?;
    if raw.len() <= 16 || (raw.len() - 16) % 16 != 0 {
        return Err(Error::BadPadding);
    }

    let key = Sha256::digest(encrypt_key.as_bytes());
    let (iv, ciphertext) = raw.split_at(16);
    let mut buffer = ciphertext.to_vec();
    let plain = Aes256CbcDec::new(key.as_slice().into(), iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| Error::BadPadding)?;
    String::from_utf8(plain.to_vec()).map_err(|_| Error::BadPadding)
}

#[cfg(test)]
mod tests {
    use {
        aes::cipher::BlockEncryptMut,
        cbc::cipher::KeyIvInit as _,
    };

    use super::*;

    type Aes256CbcEnc = cbc::Encryptor<Aes256>;

    fn encrypt_event(plain: &str, encrypt_key: &str, iv: [u8; 16]) -> String {
        let key = Sha256::digest(encrypt_key.as_bytes());
        let ciphertext = Aes256CbcEnc::new(key.as_slice().into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());
        let mut framed = iv.to_vec();
        framed.extend(ciphertext);
        base64::engine::general_purpose::STANDARD.encode(framed)
    }

    #[test]
    fn decrypts_what_the_platform_would_encrypt() {
        let payload = r#"{"challenge":"c1","type":"url_verification"}"#;
        let cipher = encrypt_event(payload, "key-from-console", [7u8; 16]);
        assert_eq!(decrypt_event(&cipher, "key-from-console").unwrap(), payload);
    }

    #[test]
    fn wrong_key_or_garbage_fails_closed() {
        let cipher = encrypt_event("{}", "right-key", [1u8; 16]);
        // a wrong key must never yield the original plaintext
        assert_ne!(
            decrypt_event(&cipher, "wrong-key").ok().as_deref(),
            Some("{}")
        );
        assert!(decrypt_event("!!!", "right-key").is_err());
        assert!(decrypt_event("", "right-key").is_err());
    }
}
