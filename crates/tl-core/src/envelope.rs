//! Envelope shape validation.
//!
//! An inbound envelope must be an object carrying all four required fields
//! before any decryption is attempted. Rejection is wholesale; there is no
//! partial envelope processing.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::Envelope;

/// The required envelope keys, in wire spelling.
pub const REQUIRED_KEYS: [&str; 4] = ["identifier", "siteUrl", "publicKey", "nonce"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope is empty")]
    Empty,
    #[error("envelope is not an object")]
    NotAnObject,
    #[error("envelope is missing required field: {0}")]
    Missing(&'static str),
    #[error("envelope field {0} is blank or not a string")]
    BadField(&'static str),
}

fn required_string(
    map: &Map<String, Value>,
    key: &'static str,
) -> Result<String, EnvelopeError> {
    let value = map.get(key).ok_or(EnvelopeError::Missing(key))?;
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
        _ => Err(EnvelopeError::BadField(key)),
    }
}

/// Check an inbound envelope has the required shape.
pub fn verify_envelope(raw: &Value) -> Result<Envelope, EnvelopeError> {
    let map = match raw {
        Value::Object(map) => map,
        _ => return Err(EnvelopeError::NotAnObject),
    };
    if map.is_empty() {
        return Err(EnvelopeError::Empty);
    }
    Ok(Envelope {
        identifier: required_string(map, "identifier")?,
        site_url: required_string(map, "siteUrl")?,
        public_key: required_string(map, "publicKey")?,
        nonce: required_string(map, "nonce")?,
    })
}
