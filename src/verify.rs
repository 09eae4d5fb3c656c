use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

use crate::types::{IdTokenClaims, Jwk};

/// Signature algorithms accepted for ID tokens. `none` and symmetric
/// algorithms stay off this list so a token cannot downgrade verification.
pub const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
];

/// Grace period applied to `exp`/`nbf` checks, in seconds.
pub const CLOCK_SKEW_LEEWAY_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("malformed JWT: {0}")]
    Malformed(String),

    #[error("algorithm {0} is not allowed for ID tokens")]
    DisallowedAlgorithm(String),

    #[error("no JWK found for kid \"{kid}\"; available kids: {known_kids}")]
    KeyNotFound { kid: String, known_kids: String },

    #[error("invalid JWK: {0}")]
    InvalidKey(#[source] jsonwebtoken::errors::Error),

    #[error("token validation failed: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// The unverified JOSE header of a JWT. Decoded before any signature check to
/// pick the verification key and reject disallowed algorithms up front.
#[derive(Debug, Deserialize)]
struct ProtectedHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

fn decode_protected_header(header_b64: &str) -> Result<ProtectedHeader, VerifyError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(header_b64.trim())
        .map_err(|error| VerifyError::Malformed(format!("header is not base64url: {}", error)))?;

    serde_json::from_slice(&bytes)
        .map_err(|error| VerifyError::Malformed(format!("header is not valid JSON: {}", error)))
}

fn allowed_algorithm(alg: &str) -> Result<Algorithm, VerifyError> {
    match alg {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "PS256" => Ok(Algorithm::PS256),
        other => Err(VerifyError::DisallowedAlgorithm(other.to_string())),
    }
}

/// Select the JWK matching the `kid` of the given (unverified) JWT header
/// segment and convert it into a usable decoding key.
///
/// A missing match is a hard failure; the error lists every kid the JWKS
/// offered so a rotated-key mismatch is diagnosable from the message alone.
pub fn select_verification_key(header_b64: &str, keys: &[Jwk]) -> Result<DecodingKey, VerifyError> {
    let header = decode_protected_header(header_b64)?;
    let kid = header
        .kid
        .ok_or_else(|| VerifyError::Malformed("no kid in JWT header".to_string()))?;

    match keys.iter().find(|jwk| jwk.kid == kid) {
        Some(jwk) => {
            DecodingKey::from_rsa_components(&jwk.n, &jwk.e).map_err(VerifyError::InvalidKey)
        }
        None => {
            let known_kids = keys
                .iter()
                .map(|jwk| jwk.kid.as_str())
                .collect::<Vec<_>>()
                .join(", ");

            Err(VerifyError::KeyNotFound { kid, known_kids })
        }
    }
}

/// Validate an ID token's signature and claims.
///
/// The signature must verify under one of [`ALLOWED_ALGORITHMS`], `aud` must
/// contain `client_id`, `iss` must equal `issuer`, and `exp`/`nbf` are checked
/// with [`CLOCK_SKEW_LEEWAY_SECS`] of grace. Any failure is an `Err`; callers
/// treat that as authentication failure.
pub fn validate_id_token(
    id_token: &str,
    key: &DecodingKey,
    client_id: &str,
    issuer: &str,
) -> Result<IdTokenClaims, VerifyError> {
    let header_b64 = id_token.split('.').next().unwrap_or_default();
    let header = decode_protected_header(header_b64)?;
    let algorithm = allowed_algorithm(&header.alg)?;

    let mut validation = Validation::new(algorithm);
    validation.algorithms = ALLOWED_ALGORITHMS.to_vec();
    validation.leeway = CLOCK_SKEW_LEEWAY_SECS;
    validation.validate_nbf = true;
    validation.set_audience(&[client_id]);
    validation.set_issuer(&[issuer]);

    let token_data = decode::<IdTokenClaims>(id_token, key, &validation)?;

    Ok(token_data.claims)
}
