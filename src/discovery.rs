use reqwest::StatusCode;
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::error::{AppError, Result};
use crate::types::DiscoveryDocument;

/// Cached OpenID Provider endpoints.
///
/// Always replaced wholesale by [`OpConfigCache::init`]; the per-field setters
/// exist only for deployment-config overrides of a single endpoint.
#[derive(Debug, Clone, Default)]
struct OpConfig {
    initiated: bool,
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    end_session_endpoint: Option<String>,
    jwks_uri: Option<String>,
    revoke_endpoint: Option<String>,
    issuer: Option<String>,
}

/// Caches the OpenID Provider's discovery document for the process lifetime.
///
/// Uninitialized until the first successful [`init`](OpConfigCache::init);
/// while a fetch is in flight, concurrent initializers wait on the same
/// attempt instead of issuing redundant discovery requests; once initiated,
/// further non-forced calls are a no-op. A forced reinit runs the fetch again
/// and swaps in the new endpoint set atomically.
#[derive(Debug, Default)]
pub struct OpConfigCache {
    config: RwLock<OpConfig>,
    init_gate: Mutex<()>,
}

impl OpConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initiated(&self) -> bool {
        self.config.read().unwrap().initiated
    }

    /// Fetch and cache the provider's discovery document.
    ///
    /// Resolves immediately when already initiated and `force_init` is false.
    /// Fails before any network call on an empty or unparsable URL; fails on
    /// a non-200 response. On success all endpoint fields are replaced in one
    /// swap, so a partial document can never leave the cache half-populated.
    pub async fn init(
        &self,
        http_client: &reqwest::Client,
        well_known_url: &str,
        force_init: bool,
    ) -> Result<()> {
        if well_known_url.trim().is_empty() {
            return Err(AppError::Precondition(
                "Invalid well-known URL found".to_string(),
            ));
        }

        if !force_init && self.is_initiated() {
            debug!("OpenID provider configuration already initiated");
            return Ok(());
        }

        Url::parse(well_known_url)
            .map_err(|error| AppError::Precondition(format!("Invalid well-known URL: {}", error)))?;

        // Coalesce concurrent initialization: only one fetch is in flight,
        // late arrivals re-check the flag once the winner has populated it.
        let _guard = self.init_gate.lock().await;

        if !force_init && self.is_initiated() {
            return Ok(());
        }

        let response = http_client.get(well_known_url).send().await?;

        if response.status() != StatusCode::OK {
            return Err(AppError::Discovery(format!(
                "invalid status code {} from {}",
                response.status(),
                well_known_url
            )));
        }

        let document: DiscoveryDocument = response
            .json()
            .await
            .map_err(|error| AppError::Discovery(format!("invalid discovery document: {}", error)))?;

        let config = OpConfig {
            initiated: true,
            revoke_endpoint: Some(derive_revoke_endpoint(&document.token_endpoint)),
            authorization_endpoint: Some(document.authorization_endpoint),
            token_endpoint: Some(document.token_endpoint),
            end_session_endpoint: Some(document.end_session_endpoint),
            jwks_uri: Some(document.jwks_uri),
            issuer: Some(document.issuer),
        };

        *self.config.write().unwrap() = config;

        info!(
            "Initialized OpenID provider configuration from {}",
            well_known_url
        );

        Ok(())
    }

    /// Clear all cached endpoints and the initiated flag.
    pub fn reset(&self) {
        *self.config.write().unwrap() = OpConfig::default();
    }

    pub fn authorization_endpoint(&self) -> Option<String> {
        self.config.read().unwrap().authorization_endpoint.clone()
    }

    pub fn set_authorization_endpoint(&self, endpoint: &str) {
        self.config.write().unwrap().authorization_endpoint = Some(endpoint.to_string());
    }

    pub fn token_endpoint(&self) -> Option<String> {
        self.config.read().unwrap().token_endpoint.clone()
    }

    pub fn set_token_endpoint(&self, endpoint: &str) {
        self.config.write().unwrap().token_endpoint = Some(endpoint.to_string());
    }

    pub fn end_session_endpoint(&self) -> Option<String> {
        self.config.read().unwrap().end_session_endpoint.clone()
    }

    pub fn set_end_session_endpoint(&self, endpoint: &str) {
        self.config.write().unwrap().end_session_endpoint = Some(endpoint.to_string());
    }

    pub fn jwks_uri(&self) -> Option<String> {
        self.config.read().unwrap().jwks_uri.clone()
    }

    pub fn set_jwks_uri(&self, uri: &str) {
        self.config.write().unwrap().jwks_uri = Some(uri.to_string());
    }

    pub fn revoke_endpoint(&self) -> Option<String> {
        self.config.read().unwrap().revoke_endpoint.clone()
    }

    pub fn set_revoke_endpoint(&self, endpoint: &str) {
        self.config.write().unwrap().revoke_endpoint = Some(endpoint.to_string());
    }

    pub fn issuer(&self) -> Option<String> {
        self.config.read().unwrap().issuer.clone()
    }

    pub fn set_issuer(&self, issuer: &str) {
        self.config.write().unwrap().issuer = Some(issuer.to_string());
    }
}

/// The revocation endpoint is not part of the discovery document; it is
/// derived by rewriting everything after the last `token` substring of the
/// token endpoint. Breaks for providers whose token endpoint path does not
/// end in `token`.
pub fn derive_revoke_endpoint(token_endpoint: &str) -> String {
    match token_endpoint.rfind("token") {
        Some(index) => format!("{}revoke", &token_endpoint[..index]),
        None => "revoke".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoke_endpoint_replaces_token_suffix() {
        assert_eq!(
            derive_revoke_endpoint("https://idp/oauth2/token"),
            "https://idp/oauth2/revoke"
        );
    }

    #[test]
    fn revoke_endpoint_rewrites_last_token_occurrence() {
        assert_eq!(
            derive_revoke_endpoint("https://token.idp.example/oauth2/token"),
            "https://token.idp.example/oauth2/revoke"
        );
    }

    #[test]
    fn revoke_endpoint_degenerates_without_token_substring() {
        assert_eq!(derive_revoke_endpoint("https://idp/oauth2/t"), "revoke");
    }

    #[test]
    fn setters_override_single_fields() {
        let cache = OpConfigCache::new();
        assert!(!cache.is_initiated());
        assert!(cache.token_endpoint().is_none());

        cache.set_token_endpoint("https://idp/oauth2/token");
        cache.set_jwks_uri("https://idp/oauth2/jwks");

        assert_eq!(cache.token_endpoint().unwrap(), "https://idp/oauth2/token");
        assert_eq!(cache.jwks_uri().unwrap(), "https://idp/oauth2/jwks");
        // overrides alone do not mark the cache as initiated
        assert!(!cache.is_initiated());
    }

    #[test]
    fn reset_clears_everything() {
        let cache = OpConfigCache::new();
        cache.set_authorization_endpoint("https://idp/oauth2/authorize");
        cache.set_issuer("https://idp/oauth2/token");

        cache.reset();

        assert!(cache.authorization_endpoint().is_none());
        assert!(cache.issuer().is_none());
        assert!(!cache.is_initiated());
    }

    #[tokio::test]
    async fn init_rejects_empty_url_before_any_network_call() {
        let cache = OpConfigCache::new();
        let client = reqwest::Client::new();

        let error = cache.init(&client, "   ", false).await.unwrap_err();
        assert!(matches!(error, AppError::Precondition(_)));
    }
}
