//! Caller-facing error taxonomy for the access-key exchange.
//!
//! Module-level errors roll up into [`ExchangeError`]. Every variant
//! carries a stable machine-readable code and a human-readable message;
//! per-item causes are logged at the point of failure and never surface
//! raw to the caller.

use thiserror::Error;

use crate::api::{ApiError, TransportError};
use crate::store::StoreError;
use crate::types::ACCESS_KEY_LENGTH;

/// Unified error type for one redemption request.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Access key is not exactly the required length. Never retried.
    #[error("invalid access key: expected {ACCESS_KEY_LENGTH} characters, got {0}")]
    InvalidAccessKey(usize),

    /// Account id missing, unparsable, or not configured as a team.
    #[error("no team is configured for account id {0:?}")]
    NoAccountId(String),

    /// The requester's role is not in the team's approved set.
    #[error("requester role is not approved to redeem access keys for this team")]
    InvalidRole,

    /// The install identity pair is missing and could not be produced.
    /// Global, so fatal for the whole request.
    #[error("install identity key pair is unavailable")]
    IdentityUnavailable,

    /// The account service could not be reached. Safe to retry.
    #[error("account service unreachable: {0}")]
    Transport(#[from] TransportError),

    /// The account service returned a structured error.
    #[error("account service error: {0}")]
    Api(ApiError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The server was reached but nothing usable came back: no secrets
    /// matched, or every matching secret failed per-item processing.
    #[error("no valid secrets could be redeemed for this access key")]
    NoValidSecrets,
}

impl From<ApiError> for ExchangeError {
    fn from(err: ApiError) -> Self {
        // Keep "couldn't reach the server" distinguishable from "the
        // server said no".
        match err {
            ApiError::Transport(transport) => ExchangeError::Transport(transport),
            other => ExchangeError::Api(other),
        }
    }
}

impl ExchangeError {
    /// Stable machine-readable code for UI and API consumers.
    pub fn code(&self) -> &'static str {
        match self {
            ExchangeError::InvalidAccessKey(_) => "invalid_access_key",
            ExchangeError::NoAccountId(_) => "no_account_id",
            ExchangeError::InvalidRole => "invalid_role",
            ExchangeError::IdentityUnavailable => "identity_unavailable",
            ExchangeError::Transport(_) => "service_unreachable",
            ExchangeError::Api(api) => api.code(),
            ExchangeError::Store(_) => "store_error",
            ExchangeError::NoValidSecrets => "no_valid_secrets",
        }
    }

    /// Whether a retry at a higher layer can plausibly succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, ExchangeError::Transport(_))
    }
}
