//! Authenticated asymmetric encryption for envelope payloads.
//!
//! Implements a crypto-box construction over X25519 + HKDF + ChaCha20Poly1305.
//! Both sides hold static keys; the 24-byte exchange nonce salts the KDF so
//! derived keys are bound to one envelope.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Exchange nonce length in bytes.
pub const BOX_NONCE_LEN: usize = 24;
/// X25519 public key length in bytes.
pub const BOX_KEY_LEN: usize = 32;
/// Poly1305 tag length; no ciphertext can be shorter.
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum BoxError {
    /// Input had the wrong shape; no primitive ran.
    #[error("malformed input: {0}")]
    MalformedInput(&'static str),
    /// The AEAD ran but the ciphertext failed to authenticate.
    #[error("decryption failed")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
}

fn kdf_key_nonce(shared_secret: &[u8; 32], salt: &[u8]) -> ([u8; 32], [u8; 12]) {
    // HKDF-SHA256(salt, shared_secret)
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);

    let mut key = [0u8; 32];
    hk.expand(b"tl_box_v1_key", &mut key).unwrap(); // Output size matches digest size, infallible

    let mut nonce = [0u8; 12];
    hk.expand(b"tl_box_v1_nonce", &mut nonce).unwrap(); // Output size < digest size, infallible

    (key, nonce)
}

fn x25519_pub_from_bytes(b: &[u8]) -> Result<X25519PublicKey, BoxError> {
    let arr: [u8; BOX_KEY_LEN] = b
        .try_into()
        .map_err(|_| BoxError::MalformedInput("public key"))?;
    Ok(X25519PublicKey::from(arr))
}

fn derive_cipher(
    nonce: &[u8],
    remote_pub: &[u8],
    local_secret: &StaticSecret,
) -> Result<(ChaCha20Poly1305, [u8; 12]), BoxError> {
    if nonce.len() != BOX_NONCE_LEN {
        return Err(BoxError::MalformedInput("nonce"));
    }
    let remote = x25519_pub_from_bytes(remote_pub)?;
    let shared = local_secret.diffie_hellman(&remote);
    let (key32, nonce12) = kdf_key_nonce(&shared.to_bytes(), nonce);
    Ok((ChaCha20Poly1305::new(Key::from_slice(&key32)), nonce12))
}

/// Decrypt a crypto box sealed to `local_secret` by the holder of `remote_pub`.
///
/// All cross-boundary length checks run before the primitives, so a
/// wrong-size nonce or key reports [`BoxError::MalformedInput`] rather than
/// a generic [`BoxError::DecryptFailed`].
pub fn open_box(
    ciphertext: &[u8],
    nonce: &[u8],
    remote_pub: &[u8],
    local_secret: &StaticSecret,
) -> Result<Vec<u8>, BoxError> {
    if ciphertext.len() < TAG_LEN {
        return Err(BoxError::MalformedInput("ciphertext"));
    }
    let (cipher, nonce12) = derive_cipher(nonce, remote_pub, local_secret)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce12), ciphertext)
        .map_err(|_| BoxError::DecryptFailed)
}

/// Seal `plaintext` to `remote_pub`.
///
/// The client-site side of the exchange uses this to produce envelope
/// payloads; the vendor side opens them with [`open_box`].
pub fn seal_box(
    plaintext: &[u8],
    nonce: &[u8],
    remote_pub: &[u8],
    local_secret: &StaticSecret,
) -> Result<Vec<u8>, BoxError> {
    let (cipher, nonce12) = derive_cipher(nonce, remote_pub, local_secret)?;
    cipher
        .encrypt(Nonce::from_slice(&nonce12), plaintext)
        .map_err(|_| BoxError::EncryptFailed)
}
