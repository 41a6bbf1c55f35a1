//! HTTP client for the account service.
//!
//! Every authenticated call carries a bearer token derived from the team
//! private key and a secondary `X-TL-TOKEN` header derived from both team
//! keys. Responses map onto a closed error taxonomy; transport failures
//! pass through unchanged so "service unreachable" stays distinguishable
//! from "service said no".

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use tl_crypto::hash::sha256_hex;
use tl_crypto::identity::SignedNonce;

use crate::types::{AccountStatus, RequesterContext, TeamCredential};

/// Default production endpoint of the account service.
pub const DEFAULT_API_URL: &str = "https://app.tetherlink.io/api/v1/";

/// Secondary auth header carried on every authenticated call.
pub const TOKEN_HEADER: &str = "X-TL-TOKEN";

/// Errors from the transport layer: the service could not be reached at
/// all. Safe to retry at a higher layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timed out")]
    Timeout,
}

/// Errors from the account service API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport failure, passed through unchanged.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Auth is mandated by configuration but no team keys are available.
    #[error("authentication required but no account keys are configured")]
    AuthRequired,

    /// 424/410: the signature or vault for this exchange is gone or invalid.
    #[error("signature error (HTTP {status}): {message}")]
    Signature { status: u16, message: String },

    /// 403/404 from the generic call path.
    #[error("not found or access denied (HTTP {0})")]
    NotFound(u16),

    #[error("response body was empty")]
    EmptyBody,

    #[error("response body did not decode to an object")]
    MalformedResponse,

    #[error("account service returned errors: {0}")]
    Errors(String),

    // Account verification outcomes, one variant per condition so UI
    // messaging can stay specific.
    #[error("account has an unpaid subscription or payment is required")]
    SubscriptionRequired,

    #[error("account service rejected the team credentials")]
    BadCredentials,

    #[error("no account found for this account id")]
    UnknownAccount,

    #[error("account service does not accept this method")]
    WrongMethod,

    #[error("account service failed internally")]
    ServerError,

    #[error("account is not active (status {0:?})")]
    AccountInactive(String),

    #[error("account problem, contact support (HTTP {0})")]
    ContactSupport(u16),

    #[error("unexpected response (HTTP {0})")]
    Unexpected(u16),
}

impl ApiError {
    /// Stable machine-readable sub-code, preserved for UI messaging.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Transport(_) => "service_unreachable",
            ApiError::AuthRequired => "auth_required",
            ApiError::Signature { .. } => "signature_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::EmptyBody => "empty_body",
            ApiError::MalformedResponse => "malformed_response",
            ApiError::Errors(_) => "api_errors",
            ApiError::SubscriptionRequired => "subscription_required",
            ApiError::BadCredentials => "bad_credentials",
            ApiError::UnknownAccount => "unknown_account",
            ApiError::WrongMethod => "wrong_method",
            ApiError::ServerError => "server_error",
            ApiError::AccountInactive(_) => "account_inactive",
            ApiError::ContactSupport(_) => "contact_support",
            ApiError::Unexpected(_) => "unexpected_response",
        }
    }
}

/// Connection settings for the account service.
#[derive(Clone, Debug, Deserialize)]
pub struct ApiSettings {
    /// Base URL of the account service API.
    #[serde(default = "default_api_url")]
    pub base_url: String,
    /// Public URL of this install, sent with verification calls.
    #[serde(default)]
    pub endpoint_url: String,
    /// Whether calls must carry team credentials.
    #[serde(default = "default_true")]
    pub auth_required: bool,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            endpoint_url: String::new(),
            auth_required: true,
        }
    }
}

/// One outbound request as handed to the transport.
#[derive(Clone, Debug)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// Raw transport-level response before taxonomy mapping.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// Transport seam for the API client.
///
/// Tests drive the client with an in-memory implementation; production
/// uses [`ReqwestTransport`]. Timeouts belong to the transport and surface
/// like any other transport failure.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// reqwest-backed transport with rustls TLS.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(map_reqwest_err)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest_err)?;
        Ok(ApiResponse { status, body })
    }
}

fn map_reqwest_err(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::ConnectionFailed(e.to_string())
    }
}

/// The pair of auth tokens derived from a team's keys.
#[derive(Clone)]
struct TeamTokens {
    bearer: String,
    tl_token: String,
}

impl TeamTokens {
    fn derive(team: &TeamCredential) -> Option<Self> {
        if !team.is_active() {
            return None;
        }
        Some(Self {
            bearer: sha256_hex(team.private_key.as_bytes()),
            tl_token: sha256_hex(
                format!("{}{}", team.public_key, team.private_key).as_bytes(),
            ),
        })
    }
}

/// Authenticated client for the account service.
pub struct ApiClient<T: HttpTransport> {
    transport: Arc<T>,
    settings: ApiSettings,
    tokens: Option<TeamTokens>,
}

impl<T: HttpTransport> ApiClient<T> {
    pub fn new(transport: Arc<T>, settings: ApiSettings) -> Self {
        Self {
            transport,
            settings,
            tokens: None,
        }
    }

    /// Attach a team's credentials; subsequent calls carry the derived
    /// bearer and `X-TL-TOKEN` headers.
    pub fn for_team(mut self, team: &TeamCredential) -> Self {
        self.tokens = TeamTokens::derive(team);
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.settings.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn headers(&self) -> Result<Vec<(String, String)>, ApiError> {
        let mut headers = vec![(
            "Content-Type".to_string(),
            "application/json".to_string(),
        )];
        match &self.tokens {
            Some(tokens) => {
                headers.push((
                    "Authorization".to_string(),
                    format!("Bearer {}", tokens.bearer),
                ));
                headers.push((TOKEN_HEADER.to_string(), tokens.tl_token.clone()));
            }
            None if self.settings.auth_required => return Err(ApiError::AuthRequired),
            None => {}
        }
        Ok(headers)
    }

    /// Issue one call and map the response onto the error taxonomy.
    ///
    /// `Ok(None)` is the 204 sentinel: the call succeeded with zero
    /// results. Header construction fails fast, before any transport work.
    pub async fn call(
        &self,
        endpoint: &str,
        body: Option<Value>,
        method: Method,
    ) -> Result<Option<Map<String, Value>>, ApiError> {
        let headers = self.headers()?;
        let request = ApiRequest {
            method,
            url: self.url(endpoint),
            headers,
            body,
        };
        debug!(url = %request.url, "account service call");
        let response = self.transport.execute(request).await?;
        handle_response(response)
    }

    /// Check the account's standing with the account service.
    pub async fn verify(&self, account_id: u64) -> Result<AccountStatus, ApiError> {
        let body = json!({ "api_endpoint": self.settings.endpoint_url });
        let request = ApiRequest {
            method: Method::POST,
            url: self.url(&format!("accounts/{account_id}")),
            headers: self.headers()?,
            body: Some(body),
        };
        let response = self.transport.execute(request).await?;
        match response.status {
            402 => return Err(ApiError::SubscriptionRequired),
            400 | 403 => return Err(ApiError::BadCredentials),
            404 => return Err(ApiError::UnknownAccount),
            405 => return Err(ApiError::WrongMethod),
            500 => return Err(ApiError::ServerError),
            status if !(200..300).contains(&status) => {
                return Err(ApiError::Unexpected(status))
            }
            _ => {}
        }
        let decoded: Value =
            serde_json::from_str(&response.body).map_err(|_| ApiError::MalformedResponse)?;
        if decoded.get("error").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ApiError::ContactSupport(response.status));
        }
        let account: AccountStatus =
            serde_json::from_value(decoded).map_err(|_| ApiError::MalformedResponse)?;
        if account.status != "active" {
            return Err(ApiError::AccountInactive(account.status));
        }
        Ok(account)
    }

    /// Look up the secret identifiers matching an access key.
    ///
    /// A 204 from the service means no matches and yields an empty vec,
    /// not an error.
    pub async fn search_secret_ids(
        &self,
        account_id: u64,
        access_key: &str,
    ) -> Result<Vec<String>, ApiError> {
        let body = json!({ "searchKeys": [access_key] });
        let map = match self
            .call(&format!("accounts/{account_id}/sites/"), Some(body), Method::POST)
            .await?
        {
            Some(map) => map,
            None => return Ok(Vec::new()),
        };
        let secrets = map
            .get("secrets")
            .and_then(Value::as_array)
            .ok_or(ApiError::MalformedResponse)?;
        secrets
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or(ApiError::MalformedResponse)
            })
            .collect()
    }

    /// Fetch the envelope for one secret identifier, proving this
    /// install's identity with a freshly signed nonce.
    pub async fn fetch_envelope(
        &self,
        account_id: u64,
        secret_id: &str,
        requester: &RequesterContext,
        nonce: &SignedNonce,
    ) -> Result<Value, ApiError> {
        let body = json!({
            "user": { "id": requester.user_id, "name": requester.user_name },
            "nonce": nonce.nonce,
            "signedNonce": nonce.signed,
        });
        let map = self
            .call(
                &format!("sites/{account_id}/{secret_id}/get-envelope"),
                Some(body),
                Method::POST,
            )
            .await?
            .ok_or(ApiError::EmptyBody)?;
        Ok(Value::Object(map))
    }
}

/// Map a raw response onto the closed taxonomy.
fn handle_response(response: ApiResponse) -> Result<Option<Map<String, Value>>, ApiError> {
    match response.status {
        204 => return Ok(None),
        424 | 410 => {
            return Err(ApiError::Signature {
                status: response.status,
                message: body_message(&response.body)
                    .unwrap_or_else(|| "signature or vault no longer available".to_string()),
            })
        }
        403 | 404 => return Err(ApiError::NotFound(response.status)),
        _ => {}
    }
    if response.body.trim().is_empty() {
        return Err(ApiError::EmptyBody);
    }
    let decoded: Value =
        serde_json::from_str(&response.body).map_err(|_| ApiError::MalformedResponse)?;
    let map = match decoded {
        Value::Object(map) if !map.is_empty() => map,
        Value::Object(_) => return Err(ApiError::EmptyBody),
        _ => return Err(ApiError::MalformedResponse),
    };
    if let Some(errors) = map.get("errors") {
        return Err(ApiError::Errors(join_errors(errors)));
    }
    Ok(Some(map))
}

/// Best-effort message extraction from an error body.
fn body_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Join an `errors` field (array, object, or scalar) into one line.
fn join_errors(errors: &Value) -> String {
    match errors {
        Value::Array(items) => items
            .iter()
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join("; "),
        Value::Object(map) => map
            .values()
            .map(scalar_text)
            .collect::<Vec<_>>()
            .join("; "),
        other => scalar_text(other),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
