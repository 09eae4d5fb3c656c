use crate::{
    error::{AppError, Result},
    store, AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use reqwest::header::HeaderName;
use std::str::FromStr;
use tracing::{debug, error, warn};

/// Authenticated pass-through to the upstream API. Every request goes through
/// `get_access_token`, which schedules a background refresh when the token is
/// close to expiry. A 401 from upstream gets one blocking refresh-and-retry
/// before the failure is surfaced.
pub async fn proxy_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let access_token = state.sessions.get_access_token()?;

    let target_url = format!("{}/{}", state.config.api_base_url, path);
    debug!("Proxying {} request to: {}", method, target_url);

    let mut response =
        send_upstream(&state, &method, &target_url, &headers, &body, &access_token).await?;

    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        warn!("upstream rejected the access token, refreshing once");

        if let Err(refresh_error) = state.sessions.refresh_session().await {
            store::reset_authenticated_session(state.sessions.repository());
            return Err(refresh_error);
        }

        let access_token = state.sessions.get_access_token()?;
        response =
            send_upstream(&state, &method, &target_url, &headers, &body, &access_token).await?;
    }

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response_builder = Response::builder().status(status);
    for (key, value) in response.headers().iter() {
        if should_forward_response_header(key.as_str()) {
            response_builder = response_builder.header(key.clone(), value.clone());
        }
    }

    let body_bytes = response.bytes().await.map_err(AppError::Request)?;

    let final_response = response_builder
        .body(Body::from(body_bytes))
        .map_err(|e| AppError::Internal(e.into()))?;

    Ok(final_response)
}

async fn send_upstream(
    state: &AppState,
    method: &Method,
    target_url: &str,
    headers: &HeaderMap,
    body: &Bytes,
    access_token: &str,
) -> Result<reqwest::Response> {
    let http_client = state.sessions.http_client();

    let mut req_builder = match *method {
        Method::GET => http_client.get(target_url),
        Method::POST => http_client.post(target_url),
        Method::PUT => http_client.put(target_url),
        Method::DELETE => http_client.delete(target_url),
        Method::PATCH => http_client.patch(target_url),
        _ => return Err(AppError::Precondition("Unsupported method".into())),
    };

    req_builder = req_builder.header(header::AUTHORIZATION, format!("Bearer {}", access_token));

    for (key, value) in headers.iter() {
        if should_forward_header(key.as_str()) {
            if let Ok(header_name) = HeaderName::from_str(key.as_str()) {
                req_builder = req_builder.header(header_name, value.clone());
            }
        }
    }

    if !body.is_empty() {
        req_builder = req_builder.body(body.clone());
    }

    req_builder.send().await.map_err(|e| {
        error!("Proxy request failed: {}", e);
        AppError::Request(e)
    })
}

// Determine if a request header should be forwarded upstream
fn should_forward_header(header: &str) -> bool {
    let header_lower = header.to_lowercase();

    let blocked_headers = [
        "host",
        "connection",
        "content-length",
        "transfer-encoding",
        "upgrade",
        "cookie",
        "authorization", // We set this ourselves
    ];

    !blocked_headers.contains(&header_lower.as_str())
}

// Determine if a response header should be forwarded back
fn should_forward_response_header(header: &str) -> bool {
    let header_lower = header.to_lowercase();

    let blocked_headers = [
        "connection",
        "content-encoding",
        "content-length",
        "transfer-encoding",
        "upgrade",
    ];

    !blocked_headers.contains(&header_lower.as_str())
}
