use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect},
    Json,
};
use serde_json::json;
use tracing::{error, info};

use crate::{
    error::{AppError, Result},
    pkce, store,
    types::AuthorizationCallback,
    AppState,
};

/// Build the authorization-code request URL, generating and persisting the
/// PKCE verifier and CSRF state along the way. Ensures the OP configuration
/// is ready first.
pub async fn build_authorization_url(state: &AppState) -> Result<String> {
    state.sessions.ensure_op_configuration(false).await?;

    let authorization_endpoint = state
        .sessions
        .op_config()
        .authorization_endpoint()
        .filter(|endpoint| !endpoint.trim().is_empty())
        .ok_or_else(|| AppError::Precondition("Invalid authorize endpoint found".to_string()))?;

    let verifier = pkce::generate_code_verifier();
    let challenge = pkce::derive_code_challenge(&verifier);
    let oauth_state = pkce::generate_state();

    let repository = state.sessions.repository();
    store::store_code_verifier(repository, &verifier);
    repository.set(store::OAUTH_STATE, &oauth_state);

    let scope = state.config.requested_scope();
    let auth_params = vec![
        ("response_type", "code"),
        ("client_id", &state.config.client_id),
        ("redirect_uri", &state.config.redirect_uri),
        ("scope", &scope),
        ("state", &oauth_state),
        ("code_challenge", &challenge),
        ("code_challenge_method", "S256"),
    ];

    Ok(format!(
        "{}?{}",
        authorization_endpoint,
        serde_urlencoded::to_string(auth_params).unwrap()
    ))
}

// Initiate the sign-in flow: full-page redirect to the authorization endpoint
pub async fn login(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let authorization_url = build_authorization_url(&state).await?;

    info!("Redirecting to authorization endpoint");
    Ok(Redirect::to(&authorization_url))
}

// Handle the redirect back from the authorization endpoint
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<AuthorizationCallback>,
) -> Result<impl IntoResponse> {
    let repository = state.sessions.repository();

    if let Some(error) = params.error {
        error!("OAuth error: {} - {:?}", error, params.error_description);
        store::clear_code_verifier(repository);
        return Err(AppError::OAuth(format!(
            "{}: {}",
            error,
            params.error_description.unwrap_or_default()
        )));
    }

    let code = params
        .code
        .ok_or_else(|| AppError::OAuth("Missing authorization code".into()))?;
    let state_param = params
        .state
        .ok_or_else(|| AppError::OAuth("Missing state parameter".into()))?;

    let expected_state = repository
        .get(store::OAUTH_STATE)
        .ok_or(AppError::InvalidState)?;
    repository.remove(store::OAUTH_STATE);

    if state_param != expected_state {
        return Err(AppError::InvalidState);
    }

    let verifier = store::retrieve_code_verifier(repository).ok_or_else(|| {
        AppError::Precondition("No PKCE code verifier found in the session".to_string())
    })?;

    // The verifier is single-use: cleared whether or not the exchange succeeds
    let exchange = state
        .sessions
        .establish_session(&code, &verifier, &state.config.redirect_uri)
        .await;
    store::clear_code_verifier(repository);

    let session = exchange?;
    info!("signed in as {}", session.username);

    Ok(Redirect::to("/"))
}

// Sign out: reset the session and redirect to the end-session endpoint
pub async fn logout(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let logout_url = state
        .sessions
        .end_session_url(&state.config.post_logout_redirect_uri)?;

    store::reset_authenticated_session(state.sessions.repository());

    info!("Redirecting to end-session endpoint");
    Ok(Redirect::to(&logout_url))
}

// Report authentication status and the signed-in identity
pub async fn status(State(state): State<AppState>) -> Result<impl IntoResponse> {
    if !state.sessions.is_valid_session() {
        return Ok(Json(json!({ "authenticated": false })));
    }

    let repository = state.sessions.repository();
    Ok(Json(json!({
        "authenticated": true,
        "display_name": repository.get(store::DISPLAY_NAME),
        "username": repository.get(store::USERNAME),
        "email": repository.get(store::EMAIL),
    })))
}

// Explicitly refresh the access token
pub async fn refresh(State(state): State<AppState>) -> Result<impl IntoResponse> {
    if let Err(error) = state.sessions.refresh_session().await {
        // refresh_session leaves the store untouched on failure; an explicit
        // failed refresh still invalidates the session here
        store::reset_authenticated_session(state.sessions.repository());
        return Err(error);
    }

    Ok(Json(json!({ "message": "Token refreshed successfully" })))
}

// Revoke the access token without the end-session redirect
pub async fn revoke(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.sessions.revoke_access_token().await?;

    Ok(Json(json!({ "message": "Token revoked successfully" })))
}
