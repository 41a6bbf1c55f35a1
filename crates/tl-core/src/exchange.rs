//! Access-key exchange: the redemption state machine.
//!
//! A caller presents an access key and an account id. The service resolves
//! the team, checks the requester's role, searches the account service for
//! matching secret identifiers, fetches an envelope per identifier, then
//! validates and decrypts each envelope into a one-time login URL.
//!
//! Failure isolation: a transport failure on the search leg aborts the
//! request; any failure on a single secret (fetch, validation, decryption)
//! is logged with its id and stage and skipped, so one bad secret never
//! blocks the others. An exhausted batch is reported as `NoValidSecrets`.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use tracing::{debug, warn};

use tl_crypto::cryptobox::{open_box, BoxError};
use tl_crypto::hash::sha256_hex;
use tl_crypto::identity::{create_identity_nonce, Identity};

use crate::api::{ApiClient, ApiSettings, HttpTransport};
use crate::envelope::{verify_envelope, EnvelopeError};
use crate::errors::ExchangeError;
use crate::store::{CredentialStore, StoreError};
use crate::types::{
    AccessKeyRequest, Envelope, LoginTarget, RequesterContext, TeamCredential, UrlParts,
    ACCESS_KEY_LENGTH,
};

/// How the secret identifiers returned by the search are ordered before
/// redemption.
///
/// The account service returns matches oldest-first; `NewestFirst` (the
/// default) reverses them so the most recent grant is offered first.
/// `ApiOrder` keeps the service's ordering untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SecretOrdering {
    #[default]
    NewestFirst,
    ApiOrder,
}

/// States of one redemption pass. `Errored` is reachable from any state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeState {
    Received,
    Validated,
    SecretsFetched,
    EnvelopesFetched,
    Decrypted,
    Done,
    Errored,
}

/// Decides whether a requester may redeem access keys for a team.
pub trait Authorizer: Send + Sync {
    fn approve(&self, requester: &RequesterContext, team: &TeamCredential) -> bool;
}

/// Default authorizer: the requester must hold at least one of the team's
/// approved roles.
pub struct RoleAllowList;

impl Authorizer for RoleAllowList {
    fn approve(&self, requester: &RequesterContext, team: &TeamCredential) -> bool {
        requester
            .roles
            .iter()
            .any(|role| team.approved_roles.contains(role))
    }
}

/// Why one secret was skipped. Logged with its stage; never surfaced to
/// the caller.
#[derive(Debug, thiserror::Error)]
enum ItemError {
    #[error(transparent)]
    Shape(#[from] EnvelopeError),
    #[error("invalid base64 in envelope field {0}")]
    Encoding(&'static str),
    #[error(transparent)]
    Box(#[from] BoxError),
    #[error("decrypted identifier is not utf-8")]
    NotUtf8,
}

impl ItemError {
    fn stage(&self) -> &'static str {
        match self {
            ItemError::Shape(_) => "validate",
            _ => "decrypt",
        }
    }
}

/// The access-key exchange service.
pub struct AccessKeyExchange<S: CredentialStore, T: HttpTransport, A: Authorizer> {
    store: Arc<S>,
    transport: Arc<T>,
    authorizer: Arc<A>,
    settings: ApiSettings,
    ordering: SecretOrdering,
    state: ExchangeState,
}

impl<S: CredentialStore, T: HttpTransport, A: Authorizer> AccessKeyExchange<S, T, A> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<T>,
        authorizer: Arc<A>,
        settings: ApiSettings,
    ) -> Self {
        Self {
            store,
            transport,
            authorizer,
            settings,
            ordering: SecretOrdering::default(),
            state: ExchangeState::Received,
        }
    }

    pub fn with_ordering(mut self, ordering: SecretOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Current state of the most recent redemption pass.
    pub fn state(&self) -> &ExchangeState {
        &self.state
    }

    /// Redeem an access key into an ordered list of login targets.
    pub async fn redeem(
        &mut self,
        request: &AccessKeyRequest,
        requester: &RequesterContext,
    ) -> Result<Vec<LoginTarget>, ExchangeError> {
        self.state = ExchangeState::Received;
        match self.run(request, requester).await {
            Ok(targets) => {
                self.state = ExchangeState::Done;
                Ok(targets)
            }
            Err(err) => {
                self.state = ExchangeState::Errored;
                Err(err)
            }
        }
    }

    async fn run(
        &mut self,
        request: &AccessKeyRequest,
        requester: &RequesterContext,
    ) -> Result<Vec<LoginTarget>, ExchangeError> {
        // Received -> Validated. Malformed requests never reach the API
        // client; no network or crypto work happens before these checks.
        validate_access_key(&request.access_key)?;
        let account_id: u64 = request
            .account_id
            .trim()
            .parse()
            .map_err(|_| ExchangeError::NoAccountId(request.account_id.clone()))?;
        let team = match self.store.team_credential(account_id).await {
            Ok(team) => team,
            Err(StoreError::NotFound(_)) => {
                return Err(ExchangeError::NoAccountId(request.account_id.clone()))
            }
            Err(other) => return Err(other.into()),
        };
        if !self.authorizer.approve(requester, &team) {
            return Err(ExchangeError::InvalidRole);
        }
        self.state = ExchangeState::Validated;

        // The identity pair is global; if it cannot be produced the whole
        // request fails, unlike any per-secret error below.
        let stored = self
            .store
            .identity(true)
            .await?
            .ok_or(ExchangeError::IdentityUnavailable)?;
        let identity = stored.to_identity()?;

        let client = ApiClient::new(self.transport.clone(), self.settings.clone())
            .for_team(&team);

        // Validated -> SecretsFetched. A 204 search result is an empty
        // collection, not an error; a transport failure here aborts.
        let mut secret_ids = client
            .search_secret_ids(account_id, &request.access_key)
            .await?;
        if self.ordering == SecretOrdering::NewestFirst {
            secret_ids.reverse();
        }
        self.state = ExchangeState::SecretsFetched;
        debug!(account_id, count = secret_ids.len(), "secret identifiers fetched");

        // SecretsFetched -> EnvelopesFetched. One fetch per identifier,
        // each carrying a freshly signed identity nonce.
        let mut envelopes: Vec<(String, Value)> = Vec::new();
        for secret_id in secret_ids {
            let nonce = match create_identity_nonce(&identity) {
                Ok(nonce) => nonce,
                Err(err) => {
                    warn!(%secret_id, stage = "sign_nonce", error = %err, "skipping secret");
                    continue;
                }
            };
            match client
                .fetch_envelope(account_id, &secret_id, requester, &nonce)
                .await
            {
                Ok(raw) => envelopes.push((secret_id, raw)),
                Err(err) => {
                    warn!(%secret_id, stage = "fetch_envelope", error = %err, "skipping secret")
                }
            }
        }
        self.state = ExchangeState::EnvelopesFetched;

        // EnvelopesFetched -> Decrypted. Validate then decrypt each
        // envelope; failures stay per-item.
        let mut targets = Vec::new();
        for (secret_id, raw) in envelopes {
            match decrypt_envelope(&raw, &identity) {
                Ok((envelope, identifier)) => {
                    targets.push(login_target(&secret_id, envelope, identifier))
                }
                Err(err) => {
                    warn!(%secret_id, stage = err.stage(), error = %err, "skipping secret")
                }
            }
        }
        self.state = ExchangeState::Decrypted;

        if targets.is_empty() {
            return Err(ExchangeError::NoValidSecrets);
        }
        Ok(targets)
    }
}

/// Reject malformed access keys before any network or crypto work.
fn validate_access_key(access_key: &str) -> Result<(), ExchangeError> {
    if access_key.len() != ACCESS_KEY_LENGTH {
        return Err(ExchangeError::InvalidAccessKey(access_key.len()));
    }
    Ok(())
}

/// Validate an envelope and decrypt its identifier field.
///
/// The envelope's own `publicKey` is the remote counterpart for this
/// specific exchange; the locally stored team key plays no part here.
fn decrypt_envelope(raw: &Value, identity: &Identity) -> Result<(Envelope, String), ItemError> {
    let envelope = verify_envelope(raw)?;
    let ciphertext = BASE64
        .decode(&envelope.identifier)
        .map_err(|_| ItemError::Encoding("identifier"))?;
    let nonce = BASE64
        .decode(&envelope.nonce)
        .map_err(|_| ItemError::Encoding("nonce"))?;
    let remote_pub = BASE64
        .decode(&envelope.public_key)
        .map_err(|_| ItemError::Encoding("publicKey"))?;
    let plaintext = open_box(&ciphertext, &nonce, &remote_pub, identity.kex_secret())?;
    let identifier = String::from_utf8(plaintext).map_err(|_| ItemError::NotUtf8)?;
    Ok((envelope, identifier))
}

/// Derive the login URL parts for one decrypted identifier.
///
/// endpoint = sha256(siteurl + identifier); loginurl = siteurl/endpoint/identifier.
fn login_target(secret_id: &str, envelope: Envelope, identifier: String) -> LoginTarget {
    let siteurl = envelope.site_url.trim_end_matches('/').to_string();
    let endpoint = sha256_hex(format!("{siteurl}{identifier}").as_bytes());
    let loginurl = format!("{siteurl}/{endpoint}/{identifier}");
    LoginTarget {
        id: secret_id.to_string(),
        url_parts: UrlParts {
            siteurl,
            loginurl,
            endpoint,
            identifier,
        },
        envelope,
    }
}
