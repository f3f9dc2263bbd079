//! Secret decryption for plugin secure settings.
//!
//! Every secure value is stored as `base64(nonce || ciphertext)` sealed with AES-256-GCM. The
//! key is the SHA-256 digest of the configured secret key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const NONCE_SIZE: usize = 12;

#[derive(thiserror::Error, Debug)]
pub enum DecryptError {
    #[error("secure value `{0}` is not valid base64")]
    InvalidEncoding(String),
    #[error("secure value `{0}` is too short")]
    Truncated(String),
    #[error("secure value `{0}` could not be decrypted")]
    Unsealable(String),
    #[error("secure value `{0}` is not valid UTF-8")]
    InvalidUtf8(String),
    #[error("encryption failed")]
    Seal,
}

/// Turns the stored secure settings of a plugin into plaintext. Either every entry decrypts or
/// the whole call fails.
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(
        &self,
        ciphertext: &HashMap<String, String>,
    ) -> Result<HashMap<String, SecretString>, DecryptError>;
}

pub struct AesGcmDecryptor {
    key: SecretBox<[u8; 32]>,
}

impl AesGcmDecryptor {
    pub fn new(secret_key: &SecretString) -> Self {
        let digest: [u8; 32] = Sha256::digest(secret_key.expose_secret().as_bytes()).into();
        Self {
            key: SecretBox::new(Box::new(digest)),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(self.key.expose_secret()))
    }

    /// Seals a plaintext into the stored representation.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, DecryptError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| DecryptError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    fn decrypt_one(&self, name: &str, encoded: &str) -> Result<SecretString, DecryptError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|_| DecryptError::InvalidEncoding(name.to_string()))?;
        if raw.len() <= NONCE_SIZE {
            return Err(DecryptError::Truncated(name.to_string()));
        }

        let (nonce, sealed) = raw.split_at(NONCE_SIZE);
        let plain = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| DecryptError::Unsealable(name.to_string()))?;

        String::from_utf8(plain)
            .map(SecretString::from)
            .map_err(|_| DecryptError::InvalidUtf8(name.to_string()))
    }
}

impl SecretDecryptor for AesGcmDecryptor {
    fn decrypt(
        &self,
        ciphertext: &HashMap<String, String>,
    ) -> Result<HashMap<String, SecretString>, DecryptError> {
        ciphertext
            .iter()
            .map(|(name, encoded)| Ok((name.clone(), self.decrypt_one(name, encoded)?)))
            .collect()
    }
}
