//! Authentication API endpoints
//!
//! - POST /api/v1/auth/login - Password login, optional remember-me
//! - POST /api/v1/auth/logout - End the current session
//! - POST /api/v1/auth/logout-all - Revoke every session of the user
//! - GET /api/v1/auth/me - Current user
//! - GET /api/v1/auth/session - Current session, anonymous allowed

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::cookies::{append_set_cookies, get_cookie};
use crate::api::middleware::{require_auth, ApiError, AppState, AuthenticatedUser, CurrentSession};
use crate::models::{SessionContext, User};
use crate::services::user::{LoginInput, UserServiceError};

/// Request body for user login
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username_or_email: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
}

/// Response for successful login
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: UserResponse,
    /// Raw session token for clients that send `Authorization: Bearer`
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            role: user.role.to_string(),
            created_at: user.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: UserResponse,
    pub session_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub authenticated: bool,
    pub session: Option<SessionContext>,
}

/// Build the auth router
pub fn router() -> Router<AppState> {
    let protected = Router::new()
        .route("/logout", post(logout))
        .route("/logout-all", post(logout_all))
        .route("/me", get(get_current_user))
        .route_layer(axum_middleware::from_fn(require_auth));

    Router::new()
        .route("/login", post(login))
        .route("/session", get(get_current_session))
        .merge(protected)
}

/// POST /api/v1/auth/login
///
/// Always issues a fresh session id; the one the request arrived with is
/// deleted.
async fn login(
    State(state): State<AppState>,
    current: Option<CurrentSession>,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = body.username_or_email.trim().to_string();
    if username.is_empty() {
        return Err(ApiError::validation_error("Username or email is required"));
    }

    if let Err(retry_after) = state.login_limiter.check(&username).await {
        tracing::warn!(?retry_after, "Login attempts exhausted");
        return Err(ApiError::too_many_requests(retry_after));
    }

    let user = match state
        .users
        .login(LoginInput::new(username.clone(), body.password))
        .await
    {
        Ok(user) => user,
        Err(e) => {
            if matches!(e, UserServiceError::InvalidCredentials) {
                state.login_limiter.consume(&username).await;
                tracing::info!("Failed login attempt");
            }
            return Err(e.into());
        }
    };
    state.login_limiter.reset(&username).await;

    let current_id = current.map(|CurrentSession(context)| context.session_id);
    let issued = state
        .sessions
        .regenerate_session(current_id.as_deref(), Some(user.id))
        .await?;

    let mut cookies = vec![state.session_cookie(&issued.token, issued.expires_at)];
    if body.remember_me {
        let auth_token = state.auth_tokens.generate_auth_token(user.id, &user.uuid).await?;
        cookies.push(state.auth_cookie(&auth_token.token, auth_token.expires_at));
    }

    tracing::info!(user_id = user.id, remember_me = body.remember_me, "User logged in");

    let mut headers = HeaderMap::new();
    append_set_cookies(&mut headers, &cookies);

    Ok((
        headers,
        Json(LoginResponse {
            user: user.into(),
            token: issued.token,
            expires_at: issued.expires_at,
        }),
    ))
}

/// POST /api/v1/auth/logout
async fn logout(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.delete_session(&session.session_id).await?;

    if let Some(auth_cookie) = get_cookie(&headers, &state.auth.auth_cookie) {
        state.auth_tokens.delete_auth_token(auth_cookie).await?;
    }

    let mut response_headers = HeaderMap::new();
    append_set_cookies(&mut response_headers, &state.clear_auth_cookies());

    Ok((StatusCode::NO_CONTENT, response_headers))
}

/// POST /api/v1/auth/logout-all
async fn logout_all(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<impl IntoResponse, ApiError> {
    state.auth_tokens.revoke_user(user.id).await?;

    let mut response_headers = HeaderMap::new();
    append_set_cookies(&mut response_headers, &state.clear_auth_cookies());

    Ok((StatusCode::NO_CONTENT, response_headers))
}

/// GET /api/v1/auth/me
async fn get_current_user(
    AuthenticatedUser(user): AuthenticatedUser,
    CurrentSession(session): CurrentSession,
) -> Json<MeResponse> {
    Json(MeResponse {
        user: user.into(),
        session_expires_at: session.expires_at,
    })
}

/// GET /api/v1/auth/session
async fn get_current_session(current: Option<CurrentSession>) -> Json<SessionResponse> {
    let session = current.map(|CurrentSession(context)| context);
    Json(SessionResponse {
        authenticated: session.as_ref().is_some_and(|s| s.user_id.is_some()),
        session,
    })
}
