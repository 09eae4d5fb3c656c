use anyhow::{Context, Result};
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub client_id: String,
    /// Origin of this gateway, sent on token requests.
    pub client_host: String,
    pub redirect_uri: String,
    pub post_logout_redirect_uri: String,
    /// The OpenID Provider's discovery document URL.
    pub well_known_url: String,
    pub scope: String,
    /// Upstream resource server the authenticated pass-through targets.
    pub api_base_url: String,
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "4000".to_string())
            .parse()
            .context("Invalid PORT")?;

        let server_origin = std::env::var("SERVER_ORIGIN")
            .unwrap_or_else(|_| "https://localhost:9443".to_string());

        let client_host =
            std::env::var("CLIENT_HOST").unwrap_or_else(|_| format!("http://localhost:{}", port));

        Ok(Self {
            port,

            client_id: std::env::var("CLIENT_ID").context("CLIENT_ID is required")?,

            redirect_uri: std::env::var("REDIRECT_URI")
                .unwrap_or_else(|_| format!("{}/auth/callback", client_host)),

            post_logout_redirect_uri: std::env::var("POST_LOGOUT_REDIRECT_URI")
                .unwrap_or_else(|_| client_host.clone()),

            well_known_url: std::env::var("WELL_KNOWN_URL").unwrap_or_else(|_| {
                format!(
                    "{}/oauth2/token/.well-known/openid-configuration",
                    server_origin
                )
            }),

            scope: std::env::var("SCOPE").unwrap_or_else(|_| "openid".to_string()),

            api_base_url: std::env::var("API_BASE_URL")
                .unwrap_or_else(|_| format!("{}/api/server/v1", server_origin)),

            http_timeout_secs: std::env::var("HTTP_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid HTTP_TIMEOUT_SECS")?,

            client_host,
        })
    }

    pub fn server_address(&self) -> SocketAddr {
        ([0, 0, 0, 0], self.port).into()
    }

    /// The scope sent on the authorization request. `openid` is mandatory for
    /// an OIDC flow and is prepended when the configured scope omits it.
    pub fn requested_scope(&self) -> String {
        if self.scope.split_whitespace().any(|scope| scope == "openid") {
            self.scope.clone()
        } else {
            format!("openid {}", self.scope).trim_end().to_string()
        }
    }
}
