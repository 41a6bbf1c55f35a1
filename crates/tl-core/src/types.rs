//! Data model for teams, redemption requests, and login targets.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Exact length of a redeemable access key.
pub const ACCESS_KEY_LENGTH: usize = 64;

/// Role allowed to redeem access keys when a team configures none.
pub const DEFAULT_ROLE: &str = "administrator";
/// Help desk assumed when a team configures none.
pub const DEFAULT_HELPDESK: &str = "helpscout";

/// Errors from rebuilding a credential out of raw configuration values.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResetError {
    #[error("credential values are not an object")]
    NotAnObject,
    #[error("credential values are missing an account id")]
    MissingAccountId,
}

/// One vendor-side account configuration for a client relationship.
///
/// Fields are typed and named; the one genuinely dynamic area is
/// `helpdesk_settings`, which stays a string-keyed map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TeamCredential {
    pub account_id: u64,
    pub public_key: String,
    pub private_key: String,
    pub approved_roles: BTreeSet<String>,
    pub helpdesk: BTreeSet<String>,
    #[serde(default)]
    pub helpdesk_settings: Map<String, Value>,
}

impl TeamCredential {
    /// A team is active once both key halves are configured.
    pub fn is_active(&self) -> bool {
        !self.public_key.is_empty() && !self.private_key.is_empty()
    }

    /// Rebuild a credential from raw configuration values.
    ///
    /// Part of the contract: object-like nested values are coerced into
    /// string-keyed maps one level deep before field extraction (the remote
    /// API may hand back either arrays or keyed objects for the set-valued
    /// fields). `approved_roles` falls back to `administrator` and
    /// `helpdesk` to `helpscout` when empty after the rebuild.
    pub fn reset(raw: Value) -> Result<Self, ResetError> {
        let map = match raw {
            Value::Object(map) => map,
            _ => return Err(ResetError::NotAnObject),
        };

        let account_id = map
            .get("account_id")
            .and_then(account_id_value)
            .ok_or(ResetError::MissingAccountId)?;

        let mut approved_roles = string_set(map.get("approved_roles"));
        if approved_roles.is_empty() {
            approved_roles.insert(DEFAULT_ROLE.to_string());
        }

        let mut helpdesk = string_set(map.get("helpdesk"));
        if helpdesk.is_empty() {
            helpdesk.insert(DEFAULT_HELPDESK.to_string());
        }

        Ok(Self {
            account_id,
            public_key: string_field(&map, "public_key"),
            private_key: string_field(&map, "private_key"),
            approved_roles,
            helpdesk,
            helpdesk_settings: map
                .get("helpdesk_settings")
                .and_then(as_string_map)
                .unwrap_or_default(),
        })
    }
}

fn account_id_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Collect a set of strings from either an array or a keyed object.
fn string_set(value: Option<&Value>) -> BTreeSet<String> {
    let values: Vec<&Value> = match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Object(map)) => map.values().collect(),
        _ => Vec::new(),
    };
    values
        .into_iter()
        .filter_map(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Coerce an object-like value into a string-keyed map; scalars are dropped.
fn as_string_map(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.clone()))
                .collect(),
        ),
        _ => None,
    }
}

/// Ephemeral inbound redemption request.
#[derive(Clone, Debug, Deserialize)]
pub struct AccessKeyRequest {
    pub access_key: String,
    pub account_id: String,
}

/// The authenticated requester on whose behalf a redemption runs.
#[derive(Clone, Debug)]
pub struct RequesterContext {
    pub user_id: u64,
    pub user_name: String,
    pub roles: Vec<String>,
}

/// Encrypted bundle describing one authorized login target.
///
/// `identifier` is ciphertext; `public_key` is the remote party's key for
/// this specific exchange, not the stored team key. All byte-valued fields
/// travel as base64.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub identifier: String,
    #[serde(rename = "siteUrl")]
    pub site_url: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub nonce: String,
}

/// URL components of one derived login.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UrlParts {
    pub siteurl: String,
    pub loginurl: String,
    pub endpoint: String,
    pub identifier: String,
}

/// The final derived one-time login artifact. Returned to the caller and
/// consumed once; never persisted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoginTarget {
    pub id: String,
    pub url_parts: UrlParts,
    pub envelope: Envelope,
}

/// Decoded body of the account verification endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct AccountStatus {
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub error: bool,
}
