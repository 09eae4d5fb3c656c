#![allow(dead_code)]

use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oidc_gate::config::Config;
use oidc_gate::session::SessionManager;
use oidc_gate::store::{self, MemorySessionStore, SessionRepository};
use oidc_gate::types::Session;
use oidc_gate::AppState;

pub const CLIENT_ID: &str = "console-client";
pub const KID: &str = "gateway-test-key";

pub struct TestKey {
    pub encoding_key: EncodingKey,
    pub n: String,
    pub e: String,
}

/// One RSA key pair for the whole test binary; 2048-bit generation is slow
/// enough to be worth sharing.
pub fn test_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rsa::rand_core::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("failed to generate RSA key");
        let public_key = RsaPublicKey::from(&private_key);

        let pem = private_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .expect("failed to encode private key");

        let b64url = base64::engine::general_purpose::URL_SAFE_NO_PAD;

        TestKey {
            encoding_key: EncodingKey::from_rsa_pem(pem.as_bytes())
                .expect("failed to load private key"),
            n: b64url.encode(public_key.n().to_bytes_be()),
            e: b64url.encode(public_key.e().to_bytes_be()),
        }
    })
}

pub fn jwks_json() -> Value {
    let key = test_key();
    json!({
        "keys": [{
            "kid": KID,
            "kty": "RSA",
            "alg": "RS256",
            "use": "sig",
            "n": key.n,
            "e": key.e,
        }]
    })
}

pub fn sign_id_token_with(issuer: &str, sub: &str, kid: &str) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "iss": issuer,
        "sub": sub,
        "aud": CLIENT_ID,
        "exp": now + 3600,
        "iat": now,
        "preferred_username": sub,
        "email": format!("{}@example.com", sub),
    });

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    encode(&header, &claims, &test_key().encoding_key).expect("failed to sign token")
}

pub fn sign_id_token(issuer: &str, sub: &str) -> String {
    sign_id_token_with(issuer, sub, KID)
}

pub fn discovery_json(base: &str) -> Value {
    json!({
        "issuer": base,
        "authorization_endpoint": format!("{}/oauth2/authorize", base),
        "token_endpoint": format!("{}/oauth2/token", base),
        "end_session_endpoint": format!("{}/oidc/logout", base),
        "jwks_uri": format!("{}/oauth2/jwks", base),
    })
}

pub fn token_response_json(issuer: &str, sub: &str) -> Value {
    json!({
        "access_token": "refreshed-access-token",
        "refresh_token": "refreshed-refresh-token",
        "id_token": sign_id_token(issuer, sub),
        "expires_in": 3600,
        "token_type": "Bearer",
        "scope": "openid",
    })
}

pub async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery_json(&server.uri())))
        .mount(server)
        .await;
}

pub async fn mount_jwks(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/oauth2/jwks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_json()))
        .mount(server)
        .await;
}

pub fn test_config(server_uri: &str) -> Config {
    Config {
        port: 0,
        client_id: CLIENT_ID.to_string(),
        client_host: "http://localhost:4000".to_string(),
        redirect_uri: "http://localhost:4000/auth/callback".to_string(),
        post_logout_redirect_uri: "http://localhost:4000".to_string(),
        well_known_url: format!("{}/.well-known/openid-configuration", server_uri),
        scope: "openid".to_string(),
        api_base_url: format!("{}/api", server_uri),
        http_timeout_secs: 10,
    }
}

pub fn test_manager(server_uri: &str) -> Arc<SessionManager> {
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    Arc::new(SessionManager::new(
        Arc::new(MemorySessionStore::new()),
        http_client,
        CLIENT_ID.to_string(),
        "http://localhost:4000".to_string(),
        format!("{}/.well-known/openid-configuration", server_uri),
    ))
}

pub fn test_state(server_uri: &str) -> AppState {
    AppState {
        config: Arc::new(test_config(server_uri)),
        sessions: test_manager(server_uri),
    }
}

/// Seed a full session whose access token has `remaining_secs` of its
/// `expires_in` lifetime left.
pub fn seed_session(
    repository: &dyn SessionRepository,
    issuer: &str,
    remaining_secs: i64,
    expires_in: i64,
) {
    let issued_at = Utc::now().timestamp() - (expires_in - remaining_secs);

    store::init_authenticated_session(
        repository,
        &Session {
            access_token: "initial-access-token".to_string(),
            refresh_token: "initial-refresh-token".to_string(),
            id_token: sign_id_token(issuer, "admin"),
            issued_at,
            expires_in,
            display_name: "admin".to_string(),
            email: "admin@example.com".to_string(),
            username: "admin".to_string(),
        },
    );
}

/// Poll until `predicate` holds; panics after ~5 seconds.
pub async fn wait_until<F: Fn() -> bool>(predicate: F, what: &str) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}
