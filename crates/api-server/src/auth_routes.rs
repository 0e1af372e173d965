use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use journal_store::{NewUser, User};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::auth::{client_ip, AuthError, CurrentUser, SessionToken};
use crate::{ApiResponse, AppError, AppState};

#[derive(Deserialize)]
pub struct LoginRequest {
    /// Username or email.
    #[serde(alias = "email")]
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
}

pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/me", get(me))
        .route("/api/auth/logout", post(logout))
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<NewUser>,
) -> Result<(StatusCode, Json<ApiResponse<User>>), AppError> {
    let user = state.users.register(req).await?;
    tracing::info!(user_id = user.id, "Registered user {}", user.username);
    Ok((StatusCode::CREATED, Json(ApiResponse::success(user))))
}

async fn login(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<ApiResponse<LoginResponse>>, AppError> {
    let ip = client_ip(connect_info.as_ref());
    let guard = &state.brute_force_guard;

    if guard.is_locked(&ip) {
        return Err(AuthError::Locked.into());
    }

    let user = match state.users.authenticate(&req.username, &req.password).await? {
        Some(user) => user,
        None => {
            guard.record_failure(&ip);
            tracing::warn!("Failed login for {:?} from {}", req.username, ip);
            return Err(AuthError::InvalidCredentials.into());
        }
    };
    guard.record_success(&ip);

    let session = state
        .users
        .create_session(user.id, state.config.session_ttl)
        .await?;
    tracing::info!(user_id = user.id, "User logged in");

    Ok(Json(ApiResponse::success(LoginResponse {
        access_token: session.token,
        token_type: "bearer",
        expires_at: session.expires_at,
    })))
}

async fn me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<ApiResponse<User>> {
    Json(ApiResponse::success(user))
}

async fn logout(
    State(state): State<AppState>,
    Extension(SessionToken(token)): Extension<SessionToken>,
) -> Result<Json<ApiResponse<serde_json::Value>>, AppError> {
    let revoked = state.users.revoke(&token).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({ "logged_out": revoked }))))
}
