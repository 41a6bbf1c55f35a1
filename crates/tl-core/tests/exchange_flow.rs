//! Integration tests for the access-key exchange flow.
//!
//! These assemble the real store, API client, and exchange service over a
//! scripted in-memory transport and verify the end-to-end redemption
//! semantics: validation before I/O, per-item failure isolation, ordering,
//! and the empty-batch terminal error.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use tl_core::api::{ApiRequest, ApiResponse, ApiSettings, HttpTransport, TransportError, TOKEN_HEADER};
use tl_core::errors::ExchangeError;
use tl_core::exchange::{AccessKeyExchange, ExchangeState, RoleAllowList, SecretOrdering};
use tl_core::store::{CredentialStore, InMemoryStore};
use tl_core::types::{AccessKeyRequest, RequesterContext, TeamCredential};
use tl_crypto::cryptobox::seal_box;
use tl_crypto::identity::verify_signed_nonce;

enum Canned {
    Status(u16, String),
    Unreachable,
}

/// Routes requests by URL substring, first match wins; records every
/// request it sees.
struct ScriptedTransport {
    routes: Vec<(&'static str, Canned)>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    fn new(routes: Vec<(&'static str, Canned)>) -> Arc<Self> {
        Arc::new(Self {
            routes,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);
        for (needle, canned) in &self.routes {
            if url.contains(needle) {
                return match canned {
                    Canned::Status(status, body) => Ok(ApiResponse {
                        status: *status,
                        body: body.clone(),
                    }),
                    Canned::Unreachable => {
                        Err(TransportError::ConnectionFailed("connection refused".into()))
                    }
                };
            }
        }
        panic!("no scripted response for {url}");
    }
}

fn settings() -> ApiSettings {
    ApiSettings {
        base_url: "https://api.test/v1".into(),
        endpoint_url: "https://vendor.test".into(),
        auth_required: true,
    }
}

fn team() -> TeamCredential {
    TeamCredential {
        account_id: 42,
        public_key: "team-public".into(),
        private_key: "team-private".into(),
        approved_roles: BTreeSet::from(["administrator".to_string()]),
        helpdesk: BTreeSet::from(["helpscout".to_string()]),
        helpdesk_settings: Default::default(),
    }
}

fn requester() -> RequesterContext {
    RequesterContext {
        user_id: 9,
        user_name: "support agent".into(),
        roles: vec!["administrator".to_string()],
    }
}

fn request(access_key: &str, account_id: &str) -> AccessKeyRequest {
    AccessKeyRequest {
        access_key: access_key.to_string(),
        account_id: account_id.to_string(),
    }
}

fn search_body(ids: &[&str]) -> String {
    json!({ "secrets": ids }).to_string()
}

/// Seal an envelope the way a client site would: the site's static key
/// against the vendor install's public key.
fn sealed_envelope(vendor_kex_pub: &[u8; 32], site_seed: u8, identifier: &str) -> String {
    let site_secret = StaticSecret::from([site_seed; 32]);
    let site_pub = X25519PublicKey::from(&site_secret);
    let nonce = [site_seed ^ 0x5a; 24];
    let ciphertext = seal_box(identifier.as_bytes(), &nonce, vendor_kex_pub, &site_secret)
        .expect("seal");
    json!({
        "identifier": BASE64.encode(ciphertext),
        "siteUrl": "https://client.example",
        "publicKey": BASE64.encode(site_pub.as_bytes()),
        "nonce": BASE64.encode(nonce),
    })
    .to_string()
}

/// Build a store with the default team and a generated identity; returns
/// the store and the install's X25519 public key for envelope sealing.
async fn store_with_identity() -> (Arc<InMemoryStore>, [u8; 32]) {
    let store = InMemoryStore::new_shared([1u8; 32]);
    store.save_team(team()).await.unwrap();
    let stored = store.identity(true).await.unwrap().unwrap();
    let kex_pub: [u8; 32] = BASE64
        .decode(&stored.public_key)
        .unwrap()
        .try_into()
        .unwrap();
    (store, kex_pub)
}

fn exchange(
    store: Arc<InMemoryStore>,
    transport: Arc<ScriptedTransport>,
) -> AccessKeyExchange<InMemoryStore, ScriptedTransport, RoleAllowList> {
    AccessKeyExchange::new(store, transport, Arc::new(RoleAllowList), settings())
}

#[tokio::test]
async fn redeems_valid_secret_and_skips_unreachable_one() {
    let (store, kex_pub) = store_with_identity().await;
    let transport = ScriptedTransport::new(vec![
        ("/42/secretA/get-envelope", Canned::Status(200, sealed_envelope(&kex_pub, 3, "id1"))),
        ("/42/secretB/get-envelope", Canned::Unreachable),
        ("accounts/42/sites/", Canned::Status(200, search_body(&["secretA", "secretB"]))),
    ]);

    let mut service = exchange(store, transport.clone());
    let targets = service
        .redeem(&request(&"a".repeat(64), "42"), &requester())
        .await
        .unwrap();

    // secretB's transport failure is a per-item skip, never an abort.
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].id, "secretA");
    assert_eq!(targets[0].url_parts.identifier, "id1");
    assert!(targets[0].url_parts.loginurl.starts_with("https://client.example/"));
    assert_eq!(*service.state(), ExchangeState::Done);

    // One search call plus one envelope fetch per secret.
    assert_eq!(transport.seen().len(), 3);
}

#[tokio::test]
async fn envelope_fetch_proves_identity_with_a_fresh_signed_nonce() {
    let (store, kex_pub) = store_with_identity().await;
    let sign_pub = {
        let stored = store.identity(false).await.unwrap().unwrap();
        BASE64.decode(&stored.sign_public_key).unwrap()
    };
    let transport = ScriptedTransport::new(vec![
        ("get-envelope", Canned::Status(200, sealed_envelope(&kex_pub, 3, "id1"))),
        ("accounts/42/sites/", Canned::Status(200, search_body(&["secretA"]))),
    ]);

    let mut service = exchange(store, transport.clone());
    service
        .redeem(&request(&"a".repeat(64), "42"), &requester())
        .await
        .unwrap();

    let fetch = transport
        .seen()
        .into_iter()
        .find(|r| r.url.contains("get-envelope"))
        .unwrap();
    assert!(fetch.headers.iter().any(|(name, _)| name == TOKEN_HEADER));

    let body = fetch.body.unwrap();
    assert_eq!(body["user"]["id"], 9);
    verify_signed_nonce(
        &sign_pub,
        body["nonce"].as_str().unwrap(),
        body["signedNonce"].as_str().unwrap(),
    )
    .expect("nonce must verify against the install signing key");
}

#[tokio::test]
async fn wrong_length_key_is_rejected_before_any_network_call() {
    let (store, _) = store_with_identity().await;
    let transport = ScriptedTransport::new(vec![]);

    let mut service = exchange(store, transport.clone());
    let err = service
        .redeem(&request("too-short", "42"), &requester())
        .await
        .unwrap_err();

    assert!(matches!(err, ExchangeError::InvalidAccessKey(9)));
    assert_eq!(err.code(), "invalid_access_key");
    assert!(transport.seen().is_empty());
    assert_eq!(*service.state(), ExchangeState::Errored);
}

#[tokio::test]
async fn unknown_or_unparsable_account_is_rejected_before_io() {
    let (store, _) = store_with_identity().await;
    let transport = ScriptedTransport::new(vec![]);
    let mut service = exchange(store, transport.clone());

    let err = service
        .redeem(&request(&"a".repeat(64), "77"), &requester())
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::NoAccountId(ref id) if id == "77"));

    let err = service
        .redeem(&request(&"a".repeat(64), "not-a-number"), &requester())
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::NoAccountId(_)));
    assert!(transport.seen().is_empty());
}

#[tokio::test]
async fn unapproved_role_is_rejected_before_io() {
    let (store, _) = store_with_identity().await;
    let transport = ScriptedTransport::new(vec![]);

    let mut service = exchange(store, transport.clone());
    let unapproved = RequesterContext {
        roles: vec!["subscriber".to_string()],
        ..requester()
    };
    let err = service
        .redeem(&request(&"a".repeat(64), "42"), &unapproved)
        .await
        .unwrap_err();

    assert!(matches!(err, ExchangeError::InvalidRole));
    assert!(transport.seen().is_empty());
}

#[tokio::test]
async fn empty_search_result_becomes_no_valid_secrets() {
    let (store, _) = store_with_identity().await;
    let transport = ScriptedTransport::new(vec![(
        "accounts/42/sites/",
        Canned::Status(204, String::new()),
    )]);

    let mut service = exchange(store, transport);
    let err = service
        .redeem(&request(&"a".repeat(64), "42"), &requester())
        .await
        .unwrap_err();

    assert!(matches!(err, ExchangeError::NoValidSecrets));
    assert_eq!(err.code(), "no_valid_secrets");
}

#[tokio::test]
async fn search_transport_failure_aborts_the_request() {
    let (store, _) = store_with_identity().await;
    let transport =
        ScriptedTransport::new(vec![("accounts/42/sites/", Canned::Unreachable)]);

    let mut service = exchange(store, transport);
    let err = service
        .redeem(&request(&"a".repeat(64), "42"), &requester())
        .await
        .unwrap_err();

    assert!(matches!(err, ExchangeError::Transport(_)));
    assert!(err.retryable());
}

#[tokio::test]
async fn one_undecryptable_envelope_does_not_block_the_others() {
    let (store, kex_pub) = store_with_identity().await;
    // s2 carries ciphertext sealed to a different install; it authenticates
    // against nothing we hold and must be skipped.
    let foreign_pub = *X25519PublicKey::from(&StaticSecret::from([9u8; 32])).as_bytes();
    let transport = ScriptedTransport::new(vec![
        ("/42/s1/get-envelope", Canned::Status(200, sealed_envelope(&kex_pub, 3, "id1"))),
        ("/42/s2/get-envelope", Canned::Status(200, sealed_envelope(&foreign_pub, 4, "id2"))),
        ("/42/s3/get-envelope", Canned::Status(200, sealed_envelope(&kex_pub, 5, "id3"))),
        ("accounts/42/sites/", Canned::Status(200, search_body(&["s1", "s2", "s3"]))),
    ]);

    let mut service = exchange(store, transport);
    let targets = service
        .redeem(&request(&"a".repeat(64), "42"), &requester())
        .await
        .unwrap();

    let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
    // NewestFirst reverses the search order before processing.
    assert_eq!(ids, vec!["s3", "s1"]);
}

#[tokio::test]
async fn malformed_envelope_shape_is_skipped() {
    let (store, kex_pub) = store_with_identity().await;
    let transport = ScriptedTransport::new(vec![
        ("/42/s1/get-envelope", Canned::Status(200, json!({ "identifier": "x" }).to_string())),
        ("/42/s2/get-envelope", Canned::Status(200, sealed_envelope(&kex_pub, 3, "id2"))),
        ("accounts/42/sites/", Canned::Status(200, search_body(&["s1", "s2"]))),
    ]);

    let mut service = exchange(store, transport);
    let targets = service
        .redeem(&request(&"a".repeat(64), "42"), &requester())
        .await
        .unwrap();

    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].id, "s2");
}

#[tokio::test]
async fn exhausted_batch_is_no_valid_secrets() {
    let (store, _) = store_with_identity().await;
    let transport = ScriptedTransport::new(vec![
        ("get-envelope", Canned::Unreachable),
        ("accounts/42/sites/", Canned::Status(200, search_body(&["s1", "s2"]))),
    ]);

    let mut service = exchange(store, transport);
    let err = service
        .redeem(&request(&"a".repeat(64), "42"), &requester())
        .await
        .unwrap_err();

    assert!(matches!(err, ExchangeError::NoValidSecrets));
    assert_eq!(*service.state(), ExchangeState::Errored);
}

#[tokio::test]
async fn api_order_keeps_the_service_ordering() {
    let (store, kex_pub) = store_with_identity().await;
    let transport = ScriptedTransport::new(vec![
        ("/42/s1/get-envelope", Canned::Status(200, sealed_envelope(&kex_pub, 3, "id1"))),
        ("/42/s2/get-envelope", Canned::Status(200, sealed_envelope(&kex_pub, 4, "id2"))),
        ("accounts/42/sites/", Canned::Status(200, search_body(&["s1", "s2"]))),
    ]);

    let mut service =
        exchange(store, transport).with_ordering(SecretOrdering::ApiOrder);
    let targets = service
        .redeem(&request(&"a".repeat(64), "42"), &requester())
        .await
        .unwrap();

    let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["s1", "s2"]);
}
