use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use journal_store::User;
use serde_json::json;
use std::net::SocketAddr;

use crate::AppState;

#[cfg(test)]
#[path = "auth_tests.rs"]
mod auth_tests;

/// The user owning the presented session token.
#[derive(Clone, Debug)]
pub struct CurrentUser(pub User);

/// The raw bearer token of the current request, kept for logout.
#[derive(Clone, Debug)]
pub struct SessionToken(pub String);

/// Bearer-session authentication for the `/api/*` routes that need a user.
///
/// Resolves `Authorization: Bearer <token>` to a live session and inserts
/// [`CurrentUser`] and [`SessionToken`] into the request extensions.
pub async fn session_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = extract_bearer_token(&headers)?;

    let user = state
        .users
        .user_for_token(&token)
        .await
        .map_err(|e| {
            tracing::error!("Session lookup failed: {:#}", e);
            AuthError::Unavailable
        })?
        .ok_or_else(|| {
            tracing::debug!("Rejected session token {}", mask_token(&token));
            AuthError::InvalidToken
        })?;

    request.extensions_mut().insert(CurrentUser(user));
    request.extensions_mut().insert(SessionToken(token));
    Ok(next.run(request).await)
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim().to_string())
        }
        _ => Err(AuthError::MissingToken),
    }
}

/// Peer IP for brute-force tracking; "unknown" when the server was not
/// started with connect info (tests).
pub(crate) fn client_ip(connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Mask a token for logging (first and last 4 characters).
pub(crate) fn mask_token(token: &str) -> String {
    if token.len() <= 8 {
        return "****".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    InvalidCredentials,
    Locked,
    Unavailable,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "Missing bearer token"),
            AuthError::InvalidToken => write!(f, "Invalid or expired session"),
            AuthError::InvalidCredentials => write!(f, "Incorrect username or password"),
            AuthError::Locked => write!(f, "Too many failed login attempts"),
            AuthError::Unavailable => write!(f, "Authentication temporarily unavailable"),
        }
    }
}

impl std::error::Error for AuthError {}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken | AuthError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            AuthError::Locked => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut response = (
            status,
            Json(json!({
                "success": false,
                "error": self.to_string(),
            })),
        )
            .into_response();

        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, header::HeaderValue::from_static("Bearer"));
        }
        response
    }
}
