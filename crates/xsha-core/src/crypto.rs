//! Secret encryption for stored git credentials.
//!
//! AES-256-GCM with the cipher key derived from the configured key material
//! via SHA-256. Payload layout: base64(url-safe, no pad) of nonce ‖
//! ciphertext, nonce 12 bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::credentials::CredentialError;

const NONCE_LEN: usize = 12;

/// Process-wide secret cipher.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Build a cipher from arbitrary key material. The material is digested
    /// with SHA-256, so any non-empty string is acceptable.
    pub fn new(key_material: &str) -> Result<Self, CredentialError> {
        if key_material.is_empty() {
            return Err(CredentialError::EmptyKey);
        }
        let digest = Sha256::digest(key_material.as_bytes());
        let cipher =
            Aes256Gcm::new_from_slice(&digest).map_err(|_| CredentialError::CipherInit)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let mut nonce_bytes = [0_u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CredentialError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| CredentialError::Decode)?;
        if bytes.len() < NONCE_LEN {
            return Err(CredentialError::Decode);
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CredentialError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CredentialError::Decrypt)
    }
}
