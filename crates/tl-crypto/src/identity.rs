//! Identity key pair management for the vendor install.
//!
//! Provides Ed25519 signing and X25519 key exchange capabilities with
//! secure memory handling via zeroization. One identity pair exists per
//! install and proves the install's identity to the account service when
//! envelopes are fetched.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;
/// Public key length in bytes (both Ed25519 and X25519).
pub const PUBLIC_KEY_LEN: usize = 32;
/// Identity nonce length in bytes.
pub const NONCE_LEN: usize = 32;

/// Error type for identity operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("malformed signature: expected {expected} bytes, got {got}")]
    MalformedSignature { expected: usize, got: usize },
    #[error("invalid base64 encoding")]
    InvalidEncoding,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    SignatureMismatch,
    #[error("random source unavailable")]
    RngFailed,
}

/// A cryptographic identity with an Ed25519 signing key and an X25519 key
/// exchange key.
///
/// This struct holds the private key material and provides methods for
/// signing and key exchange. Key material is securely zeroized when the
/// Identity is dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    /// Ed25519 signing private key
    #[zeroize(skip)] // SigningKey implements Zeroize internally
    sign_key: SigningKey,
    /// X25519 key exchange private key
    #[zeroize(skip)] // StaticSecret implements Zeroize internally
    kex_key: StaticSecret,
}

impl Identity {
    /// Generate a new random identity using a secure random source.
    pub fn generate() -> Self {
        let sign_key = SigningKey::generate(&mut OsRng);
        let kex_key = StaticSecret::random_from_rng(OsRng);
        Self { sign_key, kex_key }
    }

    /// Create an Identity from existing key bytes.
    ///
    /// # Arguments
    /// * `sign_seed` - 32-byte Ed25519 private key seed
    /// * `kex_bytes` - 32-byte X25519 private key
    pub fn from_bytes(sign_seed: &[u8; 32], kex_bytes: &[u8; 32]) -> Self {
        let sign_key = SigningKey::from_bytes(sign_seed);
        let kex_key = StaticSecret::from(*kex_bytes);
        Self { sign_key, kex_key }
    }

    /// Get the Ed25519 signing public key bytes.
    pub fn sign_pub(&self) -> [u8; 32] {
        self.sign_key.verifying_key().to_bytes()
    }

    /// Get the X25519 key exchange public key bytes.
    pub fn kex_pub(&self) -> [u8; 32] {
        *X25519PublicKey::from(&self.kex_key).as_bytes()
    }

    /// Get the Ed25519 private key seed, for persistence.
    pub fn sign_seed(&self) -> [u8; 32] {
        self.sign_key.to_bytes()
    }

    /// Get the X25519 private key bytes, for persistence.
    pub fn kex_bytes(&self) -> [u8; 32] {
        self.kex_key.to_bytes()
    }

    /// Sign a message using Ed25519.
    ///
    /// Returns a 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }

    /// Get a reference to the X25519 static secret for crypto-box operations.
    pub fn kex_secret(&self) -> &StaticSecret {
        &self.kex_key
    }
}

/// A freshly generated identity nonce and its signature, both base64.
#[derive(Clone, Debug)]
pub struct SignedNonce {
    pub nonce: String,
    pub signed: String,
}

/// Generate a random nonce and sign it with the identity signing key.
///
/// The nonce proves to the account service that the envelope request comes
/// from the install holding the identity pair.
pub fn create_identity_nonce(identity: &Identity) -> Result<SignedNonce, IdentityError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| IdentityError::RngFailed)?;
    let signed = identity.sign(&nonce);
    Ok(SignedNonce {
        nonce: BASE64.encode(nonce),
        signed: BASE64.encode(signed),
    })
}

/// Verify an Ed25519 signature over `message`.
///
/// Fails closed: key and signature lengths are checked before the dalek
/// primitives run, so a wrong-size blob reports a malformed key/signature
/// error distinct from a verification failure on a tampered message.
pub fn verify_signature(
    pub_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let pub_arr: [u8; PUBLIC_KEY_LEN] =
        pub_key
            .try_into()
            .map_err(|_| IdentityError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                got: pub_key.len(),
            })?;
    let sig_arr: [u8; SIGNATURE_LEN] =
        signature
            .try_into()
            .map_err(|_| IdentityError::MalformedSignature {
                expected: SIGNATURE_LEN,
                got: signature.len(),
            })?;
    let verifying_key =
        VerifyingKey::from_bytes(&pub_arr).map_err(|_| IdentityError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_arr);
    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| IdentityError::SignatureMismatch)
}

/// Verify a base64 `nonce`/`signed` pair as produced by
/// [`create_identity_nonce`].
pub fn verify_signed_nonce(
    pub_key: &[u8],
    nonce_b64: &str,
    signed_b64: &str,
) -> Result<(), IdentityError> {
    let nonce = BASE64
        .decode(nonce_b64)
        .map_err(|_| IdentityError::InvalidEncoding)?;
    let signed = BASE64
        .decode(signed_b64)
        .map_err(|_| IdentityError::InvalidEncoding)?;
    verify_signature(pub_key, &nonce, &signed)
}
