use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod config;
pub mod discovery;
pub mod error;
pub mod pkce;
pub mod proxy;
pub mod session;
pub mod store;
pub mod types;
pub mod verify;

use crate::{config::Config, session::SessionManager};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Auth routes
        .route("/auth/login", get(auth::login))
        .route("/auth/callback", get(auth::callback))
        .route("/auth/logout", get(auth::logout))
        .route("/auth/status", get(auth::status))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/revoke", post(auth::revoke))
        // Authenticated pass-through
        .route(
            "/api/*path",
            get(proxy::proxy_handler)
                .post(proxy::proxy_handler)
                .put(proxy::proxy_handler)
                .delete(proxy::proxy_handler)
                .patch(proxy::proxy_handler),
        )
        // Health check
        .route("/health", get(health_check))
        // Root redirect
        .route("/", get(root_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn root_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "service": "OIDC Gate",
        "status": "running",
        "endpoints": {
            "login": "/auth/login",
            "status": "/auth/status",
            "health": "/health"
        },
        "note": "Visit /auth/login to authenticate with the OpenID provider"
    }))
}
