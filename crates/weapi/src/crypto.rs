//! WeCom callback crypto: SHA-1 signatures and AES-256-CBC payloads.
//!
//! The payload scheme predates AEAD: key = base64(EncodingAESKey + "="),
//! IV = first 16 key bytes, PKCS#7 padding with a 32-byte block, and the
//! plaintext framed as `[16 random bytes | u32_be msg_len | msg |
//! receive_id]`. The same cipher without the receive-id trailer protects
//! callback media bodies.

use {
    aes::Aes256,
    base64::Engine,
    cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding},
    rand::RngCore,
    sha1::{Digest, Sha1},
};

use qiao_channels::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// WeCom's PKCS#7 variant uses a 32-byte block.
const PAD_BLOCK: usize = 32;

/// Per-account callback cipher.
#[derive(Clone)]
pub struct WecomCrypto {
    token: String,
    key: [u8; 32],
}

impl std::fmt::Debug for WecomCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WecomCrypto").finish_non_exhaustive()
    }
}

impl WecomCrypto {
    pub fn new(token: &str, encoding_aes_key: &str) -> Result<Self> {
        let trimmed = encoding_aes_key.trim();
        let padded = if trimmed.ends_with('=') {
            trimmed.to_string()
        } else {
            format!("{trimmed}=")
        };
        let raw = base64::engine::general_purpose::STANDARD
            .decode(padded)
            .map_err(|_| Error::config_invalid("EncodingAESKey is not valid base64"))?;
        if raw.len() != 32 {
            return Err(Error::config_invalid(format!(
                "EncodingAESKey must decode to 32 bytes, got {}",
                raw.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&raw);
        Ok(Self {
            token: token.trim().to_string(),
            key,
        })
    }

    /// `sha1(sort([token, timestamp, nonce, encrypt]).join(""))`, compared
    /// case-insensitively.
    #[must_use]
    pub fn verify_signature(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypt: &str,
    ) -> bool {
        let expected = self.sign(timestamp, nonce, encrypt);
        expected.eq_ignore_ascii_case(signature.trim())
    }

    /// Compute the callback signature for an encrypted payload.
    #[must_use]
    pub fn sign(&self, timestamp: &str, nonce: &str, encrypt: &str) -> String {
        let mut parts = [
            self.token.as_str(),
            timestamp.trim(),
            nonce.trim(),
            encrypt.trim(),
        ];
        parts.sort_unstable();
        let mut sha = Sha1::new();
        for part in parts {
            sha.update(part.as_bytes());
        }
        hex::encode(sha.finalize())
    }

    /// Decrypt a base64 ciphertext and return the embedded message.
    ///
    /// When `expected_receive_id` is set, the trailing receive id must
    /// match it exactly.
    pub fn decrypt(&self, encrypt: &str, expected_receive_id: Option<&str>) -> Result<String> {
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(encrypt.trim())
            .map_err(|_| Error::BadPadding)?;
        let plain = self.decrypt_raw(&ciphertext)?;

        if plain.len() < 20 {
            return Err(Error::BadPadding);
        }
        let msg_len =
            u32::from_be_bytes([plain[16], plain[17], plain[18], plain[19]]) as usize;
        let msg_start = 20usize;
        let msg_end = msg_start.saturating_add(msg_len);
        if msg_end > plain.len() {
            return Err(Error::BadPadding);
        }

        let message = std::str::from_utf8(&plain[msg_start..msg_end])
            .map_err(|_| Error::BadPadding)?
            .to_string();
        if let Some(expected) = expected_receive_id.map(str::trim).filter(|v| !v.is_empty()) {
            let trailer =
                std::str::from_utf8(&plain[msg_end..]).map_err(|_| Error::BadPadding)?;
            if trailer != expected {
                return Err(Error::ReceiveIdMismatch);
            }
        }
        Ok(message)
    }

    /// Encrypt a message into the callback framing; returns base64.
    pub fn encrypt(&self, message: &str, receive_id: &str) -> Result<String> {
        let mut framed = Vec::with_capacity(20 + message.len() + receive_id.len() + PAD_BLOCK);
        let mut random = [0u8; 16];
        rand::rng().fill_bytes(&mut random);
        framed.extend_from_slice(&random);
        framed.extend_from_slice(&(message.len() as u32).to_be_bytes());
        framed.extend_from_slice(message.as_bytes());
        framed.extend_from_slice(receive_id.as_bytes());
        pad_block32(&mut framed);

        let iv = &self.key[..16];
        let ciphertext = Aes256CbcEnc::new((&self.key).into(), iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(&framed);
        Ok(base64::engine::general_purpose::STANDARD.encode(ciphertext))
    }

    /// Decrypt an encrypted media body (no framing, no receive-id check).
    pub fn decrypt_media(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        self.decrypt_raw(encrypted)
    }

    /// Build the encrypted+signed reply envelope for a callback response:
    /// `{encrypt, msgsignature, timestamp, nonce}` with a fresh nonce.
    pub fn encrypted_reply(&self, plaintext: &str, receive_id: &str) -> Result<EncryptedReply> {
        let encrypt = self.encrypt(plaintext, receive_id)?;
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string();
        let mut nonce_bytes = [0u8; 4];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);
        let signature = self.sign(&timestamp, &nonce, &encrypt);
        Ok(EncryptedReply {
            encrypt,
            signature,
            timestamp,
            nonce,
        })
    }

    fn decrypt_raw(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(Error::BadPadding);
        }
        let iv = &self.key[..16];
        let mut buffer = ciphertext.to_vec();
        let plain = Aes256CbcDec::new((&self.key).into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|_| Error::BadPadding)?;
        let unpadded = strip_block32_padding(plain)?;
        Ok(unpadded.to_vec())
    }
}

/// A ready-to-serialize encrypted callback reply.
#[derive(Debug, Clone)]
pub struct EncryptedReply {
    pub encrypt: String,
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
}

/// PKCS#7 pad with WeCom's 32-byte block.
fn pad_block32(data: &mut Vec<u8>) {
    let pad_len = PAD_BLOCK - (data.len() % PAD_BLOCK);
    data.extend(std::iter::repeat_n(pad_len as u8, pad_len));
}

/// Strip PKCS#7 padding with the 32-byte block size. The `cbc` crate's
/// built-in unpadder is fixed to the AES block, hence the manual check.
fn strip_block32_padding(input: &[u8]) -> Result<&[u8]> {
    let Some(&last) = input.last() else {
        return Err(Error::BadPadding);
    };
    let pad_len = last as usize;
    if pad_len == 0 || pad_len > PAD_BLOCK || pad_len > input.len() {
        return Err(Error::BadPadding);
    }
    Ok(&input[..input.len() - pad_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> WecomCrypto {
        WecomCrypto::new("callback-token", &"A".repeat(43)).unwrap()
    }

    #[test]
    fn key_must_decode_to_32_bytes() {
        assert!(WecomCrypto::new("t", &"A".repeat(43)).is_ok());
        assert!(WecomCrypto::new("t", &format!("{}=", "A".repeat(43))).is_ok());
        assert!(WecomCrypto::new("t", &"A".repeat(42)).is_err());
        assert!(WecomCrypto::new("t", "!!!").is_err());
    }

    #[test]
    fn decrypt_recovers_encrypt_output() {
        let c = crypto();
        let cipher = c.encrypt("{\"msgtype\":\"text\"}", "corp1").unwrap();
        let plain = c.decrypt(&cipher, Some("corp1")).unwrap();
        assert_eq!(plain, "{\"msgtype\":\"text\"}");
    }

    #[test]
    fn round_trip_handles_multibyte_and_block_sized_messages() {
        let c = crypto();
        for message in [
            "中文消息体",
            &"x".repeat(12),       // frame exactly one block
            &"y".repeat(PAD_BLOCK), // forces a full padding block
            "",
        ] {
            let cipher = c.encrypt(message, "rid").unwrap();
            assert_eq!(c.decrypt(&cipher, Some("rid")).unwrap(), message);
        }
    }

    #[test]
    fn receive_id_mismatch_is_rejected() {
        let c = crypto();
        let cipher = c.encrypt("hello", "corp1").unwrap();
        let err = c.decrypt(&cipher, Some("other-corp")).unwrap_err();
        assert!(matches!(err, Error::ReceiveIdMismatch));
        // without an expected id the trailer is ignored
        assert_eq!(c.decrypt(&cipher, None).unwrap(), "hello");
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let c = crypto();
        let cipher = c.encrypt("hello", "corp1").unwrap();
        let mut bytes = base64::engine::general_purpose::STANDARD
            .decode(&cipher)
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(bytes);
        assert!(c.decrypt(&tampered, Some("corp1")).is_err());

        assert!(matches!(c.decrypt("not-base64!!", None), Err(Error::BadPadding)));
        assert!(matches!(c.decrypt_media(&[1, 2, 3]), Err(Error::BadPadding)));
    }

    #[test]
    fn signature_matches_sorted_sha1_case_insensitively() {
        let c = crypto();
        let signature = c.sign("1409735669", "nonce77", "CIPHERTEXT");
        assert!(c.verify_signature(&signature, "1409735669", "nonce77", "CIPHERTEXT"));
        assert!(c.verify_signature(
            &signature.to_ascii_uppercase(),
            "1409735669",
            "nonce77",
            "CIPHERTEXT"
        ));
        assert!(!c.verify_signature(&signature, "1409735670", "nonce77", "CIPHERTEXT"));
    }

    #[test]
    fn media_round_trip_without_framing() {
        let c = crypto();
        // media bodies are padded the same way but carry no length frame
        let mut body = b"binary media payload".to_vec();
        pad_block32(&mut body);
        let iv = &c.key[..16];
        let cipher = Aes256CbcEnc::new((&c.key).into(), iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(&body);
        let plain = c.decrypt_media(&cipher).unwrap();
        assert_eq!(plain, b"binary media payload");
    }

    #[test]
    fn encrypted_reply_envelope_verifies_and_decrypts() {
        let c = crypto();
        let reply = c.encrypted_reply("{\"msgtype\":\"stream\"}", "").unwrap();
        assert!(c.verify_signature(&reply.signature, &reply.timestamp, &reply.nonce, &reply.encrypt));
        assert_eq!(c.decrypt(&reply.encrypt, None).unwrap(), "{\"msgtype\":\"stream\"}");
    }

    #[test]
    fn padding_validation_bounds() {
        assert!(strip_block32_padding(&[]).is_err());
        assert!(strip_block32_padding(&[0]).is_err());
        assert!(strip_block32_padding(&[33]).is_err());
        let mut data = vec![7u8; 4];
        data.extend(vec![28u8; 28]);
        assert_eq!(strip_block32_padding(&data).unwrap(), &[7u8; 4][..]);
    }
}
