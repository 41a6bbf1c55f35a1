//! Storage abstraction for team credentials and the install identity pair.
//!
//! This module defines the `CredentialStore` trait and provides an
//! in-memory implementation for testing and for embedding processes that
//! keep their own persistence. The identity record is vault-encrypted at
//! rest.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use tl_crypto::identity::Identity;
use tl_crypto::vault::Vault;

use crate::types::TeamCredential;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no team configured for account id {0}")]
    NotFound(u64),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

/// Persisted form of the install identity pair. All fields base64.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub public_key: String,
    pub private_key: String,
    pub sign_public_key: String,
    pub sign_private_key: String,
}

impl StoredIdentity {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            public_key: BASE64.encode(identity.kex_pub()),
            private_key: BASE64.encode(identity.kex_bytes()),
            sign_public_key: BASE64.encode(identity.sign_pub()),
            sign_private_key: BASE64.encode(identity.sign_seed()),
        }
    }

    /// Reconstruct the private identity from the persisted record.
    pub fn to_identity(&self) -> Result<Identity, StoreError> {
        let sign_seed = decode_key(&self.sign_private_key)?;
        let kex_bytes = decode_key(&self.private_key)?;
        Ok(Identity::from_bytes(&sign_seed, &kex_bytes))
    }
}

fn decode_key(field: &str) -> Result<[u8; 32], StoreError> {
    let raw = BASE64
        .decode(field)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("expected 32 key bytes, got {}", raw.len())))
}

/// Storage abstraction for team credentials and the identity key pair.
///
/// TeamCredential records are owned by persistent configuration storage;
/// this trait is the seam through which the exchange core reads them.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up the credential configured for an account id.
    ///
    /// # Returns
    /// * `Ok(team)` if a team is configured
    /// * `Err(StoreError::NotFound)` otherwise
    async fn team_credential(&self, account_id: u64) -> Result<TeamCredential, StoreError>;

    /// Save or replace a team credential, keyed by its account id.
    async fn save_team(&self, team: TeamCredential) -> Result<(), StoreError>;

    /// Load the install identity pair.
    ///
    /// With `generate_if_missing`, a missing pair is generated and
    /// persisted as a single upsert. Concurrent first-time generation may
    /// race; the last write wins, which is acceptable because the pair is
    /// only used for append-only identity proofs. Generation is never
    /// retried implicitly.
    async fn identity(&self, generate_if_missing: bool)
        -> Result<Option<StoredIdentity>, StoreError>;

    /// Delete the identity pair. The next `identity(true)` regenerates.
    async fn reset_identity(&self) -> Result<(), StoreError>;
}

/// Thread-safe in-memory store.
///
/// Uses `RwLock` for concurrent access; the persisted identity record is
/// encrypted with the supplied storage key.
pub struct InMemoryStore {
    teams: RwLock<HashMap<u64, TeamCredential>>,
    identity_blob: RwLock<Option<String>>,
    vault: Vault,
}

impl InMemoryStore {
    pub fn new(storage_key: [u8; 32]) -> Self {
        Self {
            teams: RwLock::new(HashMap::new()),
            identity_blob: RwLock::new(None),
            vault: Vault::new(&storage_key),
        }
    }

    /// Create a new in-memory store wrapped in an Arc for sharing.
    pub fn new_shared(storage_key: [u8; 32]) -> Arc<Self> {
        Arc::new(Self::new(storage_key))
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn team_credential(&self, account_id: u64) -> Result<TeamCredential, StoreError> {
        let teams = self.teams.read().await;
        teams
            .get(&account_id)
            .cloned()
            .ok_or(StoreError::NotFound(account_id))
    }

    async fn save_team(&self, team: TeamCredential) -> Result<(), StoreError> {
        let mut teams = self.teams.write().await;
        teams.insert(team.account_id, team);
        Ok(())
    }

    async fn identity(
        &self,
        generate_if_missing: bool,
    ) -> Result<Option<StoredIdentity>, StoreError> {
        if let Some(blob) = self.identity_blob.read().await.as_ref() {
            let json = self
                .vault
                .decrypt(blob)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let stored = serde_json::from_str(&json)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            return Ok(Some(stored));
        }
        if !generate_if_missing {
            return Ok(None);
        }

        let stored = StoredIdentity::from_identity(&Identity::generate());
        let json = serde_json::to_string(&stored)
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        let blob = self
            .vault
            .encrypt(&json)
            .map_err(|e| StoreError::OperationFailed(e.to_string()))?;
        // Single upsert; two first-time callers may both generate and the
        // last write wins.
        *self.identity_blob.write().await = Some(blob);
        Ok(Some(stored))
    }

    async fn reset_identity(&self) -> Result<(), StoreError> {
        *self.identity_blob.write().await = None;
        Ok(())
    }
}
