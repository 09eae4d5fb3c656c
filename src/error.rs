use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::verify::VerifyError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid user session")]
    InvalidSession,

    #[error("{0}")]
    Precondition(String),

    #[error("Invalid OAuth state")]
    InvalidState,

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Failed to load OpenID provider configuration: {0}")]
    Discovery(String),

    #[error("Token endpoint error: {0}")]
    TokenEndpoint(String),

    #[error("Failed to load public keys from JWKS endpoint: {0}")]
    Jwks(String),

    #[error("ID token verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidSession | AppError::Verification(_) => {
                (StatusCode::UNAUTHORIZED, self.to_string())
            }
            AppError::Precondition(_) | AppError::InvalidState | AppError::OAuth(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::Discovery(_)
            | AppError::TokenEndpoint(_)
            | AppError::Jwks(_)
            | AppError::Request(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
