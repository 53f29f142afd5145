// Payload sealing for cloud frames.
//
// A sealed payload is `base64(nonce ‖ ciphertext)` where the nonce is a
// fresh 96-bit value per message and the ciphertext carries the GCM tag.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

use crate::error::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for frame payloads, keyed by a shared base64 secret.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher {
    /// Build a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(key: &SecretString) -> Result<Self, Error> {
        let raw = STANDARD
            .decode(key.expose_secret().trim())
            .map_err(|e| Error::Crypto(format!("encryption key is not valid base64: {e}")))?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(key: &[u8]) -> Result<Self, Error> {
        if key.len() != KEY_LEN {
            return Err(Error::Crypto(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("invalid key: {e}")))?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` and return the base64 envelope.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, Error> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    /// Decode and decrypt a base64 envelope produced by [`seal`](Self::seal).
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, Error> {
        let raw = STANDARD
            .decode(sealed)
            .map_err(|e| Error::Crypto(format!("sealed payload is not valid base64: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::Crypto("sealed payload too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("authentication tag mismatch".into()))
    }
}

/// Generate a fresh random key, base64 encoded.
pub fn generate_key() -> String {
    let mut key = [0_u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    STANDARD.encode(key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cipher() -> PayloadCipher {
        PayloadCipher::from_base64(&SecretString::from(generate_key())).unwrap()
    }

    #[test]
    fn sealed_payload_opens_with_same_key() {
        let c = cipher();
        let sealed = c.seal(br#"{"type":"ping","nonce":1}"#).unwrap();
        assert_eq!(c.open(&sealed).unwrap(), br#"{"type":"ping","nonce":1}"#);
    }

    #[test]
    fn nonces_differ_between_messages() {
        let c = cipher();
        assert_ne!(c.seal(b"same").unwrap(), c.seal(b"same").unwrap());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sealed = cipher().seal(b"secret").unwrap();
        let err = cipher().open(&sealed).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let c = cipher();
        let mut raw = STANDARD.decode(c.seal(b"secret").unwrap()).unwrap();
        if let Some(last) = raw.last_mut() {
            *last ^= 0x01;
        }
        assert!(c.open(&STANDARD.encode(raw)).is_err());
    }

    #[test]
    fn short_keys_are_rejected() {
        let err = PayloadCipher::from_bytes(&[0_u8; 16]).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }
}
