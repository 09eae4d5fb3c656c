use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use reqwest::{header, StatusCode};
use tracing::{debug, info, warn};

use crate::discovery::OpConfigCache;
use crate::error::{AppError, Result};
use crate::store::{self, SessionRepository};
use crate::types::{IdTokenClaims, JwksResponse, Session, TokenRequest, TokenResponse};
use crate::verify;

/// Trigger a background refresh when no more than this many seconds of the
/// access token's lifetime remain.
pub const REFRESH_THRESHOLD_SECS: i64 = 300;

/// Owns the authenticated session: token reads, proactive refresh, and the
/// token-endpoint exchanges that mint or revoke a session.
pub struct SessionManager {
    repository: Arc<dyn SessionRepository>,
    op_config: OpConfigCache,
    http_client: reqwest::Client,
    client_id: String,
    client_host: String,
    well_known_url: String,
    refresh_in_flight: AtomicBool,
}

impl SessionManager {
    pub fn new(
        repository: Arc<dyn SessionRepository>,
        http_client: reqwest::Client,
        client_id: String,
        client_host: String,
        well_known_url: String,
    ) -> Self {
        Self {
            repository,
            op_config: OpConfigCache::new(),
            http_client,
            client_id,
            client_host,
            well_known_url,
            refresh_in_flight: AtomicBool::new(false),
        }
    }

    pub fn repository(&self) -> &dyn SessionRepository {
        self.repository.as_ref()
    }

    pub fn op_config(&self) -> &OpConfigCache {
        &self.op_config
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    /// Initialize the OP configuration cache from the configured well-known
    /// URL. Idempotent unless `force_init` is set.
    pub async fn ensure_op_configuration(&self, force_init: bool) -> Result<()> {
        self.op_config
            .init(&self.http_client, &self.well_known_url, force_init)
            .await
    }

    /// The central read path for every authenticated API call.
    ///
    /// Fails with [`AppError::InvalidSession`] when any of the token fields is
    /// missing. When the token has [`REFRESH_THRESHOLD_SECS`] or less left, a
    /// background refresh is scheduled and the current (possibly near-expiry)
    /// token is still returned; the refreshed token becomes visible on the
    /// next call.
    pub fn get_access_token(self: &Arc<Self>) -> Result<String> {
        let access_token = self.repository.get(store::ACCESS_TOKEN);
        let expires_in = self.repository.get(store::ACCESS_TOKEN_EXPIRES_IN);
        let issued_at = self.repository.get(store::ACCESS_TOKEN_ISSUED_AT);

        let (access_token, expires_in, issued_at) = match (access_token, expires_in, issued_at) {
            (Some(token), Some(expires_in), Some(issued_at))
                if !token.is_empty() && !expires_in.is_empty() && !issued_at.is_empty() =>
            {
                (token, expires_in, issued_at)
            }
            _ => return Err(AppError::InvalidSession),
        };

        let issued_at: i64 = issued_at.parse().map_err(|_| AppError::InvalidSession)?;
        let expires_in: i64 = expires_in.parse().map_err(|_| AppError::InvalidSession)?;

        let remaining = issued_at + expires_in - Utc::now().timestamp();

        if remaining <= REFRESH_THRESHOLD_SECS {
            debug!("access token has {}s left, scheduling refresh", remaining);
            self.spawn_refresh();
        }

        Ok(access_token)
    }

    /// Coarse-grained "am I logged in" check.
    pub fn is_valid_session(self: &Arc<Self>) -> bool {
        self.get_access_token().is_ok()
    }

    /// Schedule a background refresh. At most one refresh is outstanding at a
    /// time; concurrent triggers within the refresh window are no-ops. A
    /// failed refresh resets the session so the next read fails cleanly
    /// instead of serving stale credentials.
    fn spawn_refresh(self: &Arc<Self>) {
        if self
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("token refresh already in flight");
            return;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = manager.refresh_session().await {
                warn!("token refresh failed, resetting session: {}", error);
                store::reset_authenticated_session(manager.repository.as_ref());
            }
            manager.refresh_in_flight.store(false, Ordering::SeqCst);
        });
    }

    /// Exchange the stored refresh token for a new token set. The returned ID
    /// token is re-verified against the JWKS before the session is replaced;
    /// refresh responses are not trusted blindly. Does not reset the session
    /// on failure; that is the caller's responsibility.
    pub async fn refresh_session(&self) -> Result<()> {
        let refresh_token = self
            .repository
            .get(store::REFRESH_TOKEN)
            .filter(|token| !token.is_empty())
            .ok_or(AppError::InvalidSession)?;

        let request = TokenRequest {
            grant_type: "refresh_token".to_string(),
            client_id: self.client_id.clone(),
            code: None,
            redirect_uri: None,
            code_verifier: None,
            refresh_token: Some(refresh_token),
        };

        let token_response = self.request_tokens(&request).await?;
        let session = self.verified_session(&token_response).await?;

        store::init_authenticated_session(self.repository.as_ref(), &session);
        info!("access token refreshed for {}", session.username);

        Ok(())
    }

    /// Exchange an authorization code (plus its PKCE verifier) for tokens,
    /// verify the ID token, and persist the resulting session.
    pub async fn establish_session(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<Session> {
        let request = TokenRequest {
            grant_type: "authorization_code".to_string(),
            client_id: self.client_id.clone(),
            code: Some(code.to_string()),
            redirect_uri: Some(redirect_uri.to_string()),
            code_verifier: Some(code_verifier.to_string()),
            refresh_token: None,
        };

        let token_response = self.request_tokens(&request).await?;
        let session = self.verified_session(&token_response).await?;

        store::init_authenticated_session(self.repository.as_ref(), &session);
        info!("authenticated session established for {}", session.username);

        Ok(session)
    }

    /// Revoke the current access token at the derived revocation endpoint and
    /// clear the session.
    pub async fn revoke_access_token(&self) -> Result<()> {
        let revoke_endpoint = self
            .op_config
            .revoke_endpoint()
            .filter(|endpoint| !endpoint.trim().is_empty())
            .ok_or_else(|| {
                AppError::Precondition("Invalid revoke token endpoint found".to_string())
            })?;

        let access_token = self
            .repository
            .get(store::ACCESS_TOKEN)
            .filter(|token| !token.is_empty())
            .ok_or(AppError::InvalidSession)?;

        let form = [
            ("client_id", self.client_id.as_str()),
            ("token", access_token.as_str()),
            ("token_type_hint", "access_token"),
        ];

        let response = self
            .http_client
            .post(&revoke_endpoint)
            .header(header::ACCEPT, "application/json")
            .header("Access-Control-Allow-Origin", &self.client_host)
            .form(&form)
            .send()
            .await
            .map_err(|error| AppError::TokenEndpoint(error.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(AppError::TokenEndpoint(format!(
                "invalid status code {} in the revoke token response",
                response.status()
            )));
        }

        store::reset_authenticated_session(self.repository.as_ref());
        info!("access token revoked");

        Ok(())
    }

    /// RP-initiated logout URL. Both the cached end-session endpoint and a
    /// stored ID token are preconditions, checked before anything else.
    pub fn end_session_url(&self, post_logout_redirect_uri: &str) -> Result<String> {
        let end_session_endpoint = self
            .op_config
            .end_session_endpoint()
            .filter(|endpoint| !endpoint.trim().is_empty())
            .ok_or_else(|| {
                AppError::Precondition("No logout endpoint found in the session".to_string())
            })?;

        let id_token = self
            .repository
            .get(store::ID_TOKEN)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                AppError::Precondition("Invalid id_token found in the session".to_string())
            })?;

        let query = serde_urlencoded::to_string([
            ("id_token_hint", id_token.as_str()),
            ("post_logout_redirect_uri", post_logout_redirect_uri),
        ])
        .unwrap();

        Ok(format!("{}?{}", end_session_endpoint, query))
    }

    /// Fetch the JWKS and fully verify an ID token: key selection by `kid`,
    /// signature under the allowed algorithms, audience, issuer, expiry.
    pub async fn verify_id_token(&self, id_token: &str) -> Result<IdTokenClaims> {
        let jwks_uri = self
            .op_config
            .jwks_uri()
            .filter(|uri| !uri.trim().is_empty())
            .ok_or_else(|| AppError::Precondition("Invalid JWKS URI found".to_string()))?;

        let issuer = self
            .op_config
            .issuer()
            .filter(|issuer| !issuer.trim().is_empty())
            .ok_or_else(|| AppError::Precondition("Invalid token issuer found".to_string()))?;

        let response = self
            .http_client
            .get(&jwks_uri)
            .send()
            .await
            .map_err(|error| AppError::Jwks(error.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(AppError::Jwks(format!(
                "invalid status code {} from {}",
                response.status(),
                jwks_uri
            )));
        }

        let jwks: JwksResponse = response
            .json()
            .await
            .map_err(|error| AppError::Jwks(format!("invalid JWKS document: {}", error)))?;

        let header_b64 = id_token.split('.').next().unwrap_or_default();
        let key = verify::select_verification_key(header_b64, &jwks.keys)?;

        let claims = verify::validate_id_token(id_token, &key, &self.client_id, &issuer)?;

        Ok(claims)
    }

    async fn verified_session(&self, token_response: &TokenResponse) -> Result<Session> {
        self.verify_id_token(&token_response.id_token).await?;
        session_from_token_response(token_response)
    }

    async fn request_tokens(&self, request: &TokenRequest) -> Result<TokenResponse> {
        let token_endpoint = self
            .op_config
            .token_endpoint()
            .filter(|endpoint| !endpoint.trim().is_empty())
            .ok_or_else(|| AppError::Precondition("Invalid token endpoint found".to_string()))?;

        debug!("requesting tokens from {}", token_endpoint);

        let response = self
            .http_client
            .post(&token_endpoint)
            .header(header::ACCEPT, "application/json")
            .header("Access-Control-Allow-Origin", &self.client_host)
            .form(request)
            .send()
            .await
            .map_err(|error| AppError::TokenEndpoint(error.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(AppError::TokenEndpoint(format!(
                "invalid status code {} in the token response",
                response.status()
            )));
        }

        response.json().await.map_err(|error| {
            AppError::TokenEndpoint(format!("failed to parse token response: {}", error))
        })
    }
}

/// Build a [`Session`] from a token response.
///
/// Identity claims come from an unverified base64 decode of the ID token
/// payload; signature verification happens separately, before this is
/// persisted. `issued_at` is stamped with the current time.
pub fn session_from_token_response(token_response: &TokenResponse) -> Result<Session> {
    let payload = decode_unverified_payload(&token_response.id_token)?;

    let username = payload
        .get("sub")
        .and_then(|value| value.as_str())
        .unwrap_or_default()
        .to_string();

    let display_name = payload
        .get("preferred_username")
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| username.clone());

    let email = payload
        .get("email")
        .and_then(|value| value.as_str())
        .unwrap_or_default()
        .to_string();

    Ok(Session {
        access_token: token_response.access_token.clone(),
        refresh_token: token_response.refresh_token.clone(),
        id_token: token_response.id_token.clone(),
        issued_at: Utc::now().timestamp(),
        expires_in: token_response.expires_in,
        display_name,
        email,
        username,
    })
}

fn decode_unverified_payload(id_token: &str) -> Result<serde_json::Value> {
    let payload_b64 = id_token
        .split('.')
        .nth(1)
        .ok_or_else(|| AppError::OAuth("malformed id_token in the token response".to_string()))?;

    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AppError::OAuth("malformed id_token payload".to_string()))?;

    serde_json::from_slice(&bytes)
        .map_err(|_| AppError::OAuth("malformed id_token payload".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use base64::Engine;
    use serde_json::json;
    use std::collections::HashMap;

    fn fake_id_token(payload: serde_json::Value) -> String {
        let b64url = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        format!(
            "{}.{}.sig",
            b64url.encode(br#"{"alg":"RS256"}"#),
            b64url.encode(payload.to_string())
        )
    }

    fn token_response(id_token: String) -> TokenResponse {
        TokenResponse {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            id_token,
            expires_in: 3600,
            token_type: Some("Bearer".to_string()),
            scope: Some("openid".to_string()),
            extra: HashMap::new(),
        }
    }

    fn manager() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            reqwest::Client::new(),
            "client".to_string(),
            "http://localhost:4000".to_string(),
            "https://idp/.well-known/openid-configuration".to_string(),
        ))
    }

    #[test]
    fn session_prefers_preferred_username_for_display() {
        let id_token = fake_id_token(json!({
            "sub": "admin@carbon.super",
            "preferred_username": "admin",
            "email": "admin@example.com",
        }));

        let session = session_from_token_response(&token_response(id_token)).unwrap();

        assert_eq!(session.username, "admin@carbon.super");
        assert_eq!(session.display_name, "admin");
        assert_eq!(session.email, "admin@example.com");
        assert_eq!(session.expires_in, 3600);
        assert!(session.issued_at > 0);
    }

    #[test]
    fn session_falls_back_to_sub_for_display() {
        let id_token = fake_id_token(json!({ "sub": "admin@carbon.super" }));

        let session = session_from_token_response(&token_response(id_token)).unwrap();

        assert_eq!(session.display_name, "admin@carbon.super");
        assert_eq!(session.email, "");
    }

    #[test]
    fn malformed_id_token_is_rejected() {
        let error = session_from_token_response(&token_response("garbage".to_string())).unwrap_err();
        assert!(matches!(error, AppError::OAuth(_)));
    }

    #[tokio::test]
    async fn get_access_token_fails_on_empty_store() {
        let manager = manager();
        let error = manager.get_access_token().unwrap_err();
        assert!(matches!(error, AppError::InvalidSession));
        assert!(!manager.is_valid_session());
    }

    #[tokio::test]
    async fn get_access_token_fails_on_partial_session() {
        let manager = manager();
        // access token without issuance metadata is an invalid session
        manager.repository().set(store::ACCESS_TOKEN, "access");
        manager.repository().set(store::ACCESS_TOKEN_EXPIRES_IN, "3600");

        let error = manager.get_access_token().unwrap_err();
        assert!(matches!(error, AppError::InvalidSession));
    }

    #[tokio::test]
    async fn get_access_token_returns_token_outside_refresh_window() {
        let manager = manager();
        let issued_at = Utc::now().timestamp() - 250;
        manager.repository().set(store::ACCESS_TOKEN, "access");
        manager.repository().set(store::ACCESS_TOKEN_EXPIRES_IN, "600");
        manager
            .repository()
            .set(store::ACCESS_TOKEN_ISSUED_AT, &issued_at.to_string());

        // 350s remaining: returned as-is, no refresh scheduled
        assert_eq!(manager.get_access_token().unwrap(), "access");
        assert!(!manager.refresh_in_flight.load(Ordering::SeqCst));
    }
}
