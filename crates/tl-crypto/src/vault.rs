//! Symmetric encryption for lower-sensitivity internal storage.
//!
//! Blobs are base64(nonce || ciphertext) with a random 12-byte nonce per
//! message. Round trips are lossless for arbitrary UTF-8, including the
//! empty string.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};

const VAULT_NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("invalid blob: too short")]
    InvalidBlob,
    #[error("invalid base64 encoding")]
    InvalidEncoding,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("random source unavailable")]
    RngFailed,
    #[error("plaintext is not valid utf-8")]
    NotUtf8,
}

/// Keyed symmetric cipher for at-rest blobs.
pub struct Vault {
    cipher: ChaCha20Poly1305,
}

impl Vault {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypt a message into a self-contained base64 blob.
    pub fn encrypt(&self, message: &str) -> Result<String, VaultError> {
        let mut nonce = [0u8; VAULT_NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(|_| VaultError::RngFailed)?;
        let ct = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), message.as_bytes())
            .map_err(|_| VaultError::EncryptFailed)?;
        let mut blob = Vec::with_capacity(VAULT_NONCE_LEN + ct.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ct);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`Vault::encrypt`].
    pub fn decrypt(&self, blob: &str) -> Result<String, VaultError> {
        let raw = BASE64
            .decode(blob)
            .map_err(|_| VaultError::InvalidEncoding)?;
        if raw.len() < VAULT_NONCE_LEN + TAG_LEN {
            return Err(VaultError::InvalidBlob);
        }
        let (nonce, ct) = raw.split_at(VAULT_NONCE_LEN);
        let pt = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| VaultError::DecryptFailed)?;
        String::from_utf8(pt).map_err(|_| VaultError::NotUtf8)
    }
}
