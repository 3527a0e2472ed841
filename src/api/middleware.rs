//! API middleware
//!
//! Request authentication runs as two stages:
//! - `session_auth` resolves the session cookie (or bearer token) to a
//!   [`CurrentSession`] and, for bound sessions, an [`AuthenticatedUser`].
//!   Without a valid session it falls back to the remember-me cookie, and
//!   failing that issues an anonymous session to cookie clients.
//! - `sliding_expiration` pushes the expiry of sessions that are close to
//!   running out and re-issues the cookie.
//!
//! `require_auth` guards routes that need a user.

use axum::{
    extract::{ConnectInfo, FromRequestParts, OptionalFromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::api::cookies::{append_set_cookies, build_cookie, clear_cookie, get_cookie};
use crate::config::AuthConfig;
use crate::models::{SessionContext, SessionUpdate, User};
use crate::services::auth_token::{AuthCookieOutcome, AuthTokenError, AuthTokenManager};
use crate::services::rate_limiter::AttemptLimiter;
use crate::services::secret::CookieSigner;
use crate::services::session::{SessionError, SessionManager};
use crate::services::user::{UserService, UserServiceError};

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub auth_tokens: Arc<AuthTokenManager>,
    pub users: Arc<UserService>,
    pub signer: Arc<CookieSigner>,
    /// Failed logins per username
    pub login_limiter: Arc<dyn AttemptLimiter>,
    pub auth: Arc<AuthConfig>,
    /// Read the client address from proxy headers
    pub trust_proxy: bool,
}

impl AppState {
    /// Signed session cookie for a freshly issued or extended session
    pub fn session_cookie(&self, token: &str, expires_at: chrono::DateTime<chrono::Utc>) -> String {
        build_cookie(
            &self.auth.session_cookie,
            &self.signer.sign(token),
            expires_at,
            self.sessions.clock().now(),
            self.auth.secure_cookies,
        )
    }

    pub fn auth_cookie(&self, token: &str, expires_at: chrono::DateTime<chrono::Utc>) -> String {
        build_cookie(
            &self.auth.auth_cookie,
            token,
            expires_at,
            self.sessions.clock().now(),
            self.auth.secure_cookies,
        )
    }

    /// `Set-Cookie` values that remove both auth cookies
    pub fn clear_auth_cookies(&self) -> Vec<String> {
        vec![
            clear_cookie(&self.auth.session_cookie, self.auth.secure_cookies),
            clear_cookie(&self.auth.auth_cookie, self.auth.secure_cookies),
        ]
    }
}

/// The session attached to the current request
#[derive(Debug, Clone)]
pub struct CurrentSession(pub SessionContext);

/// Authenticated user extracted from request
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

/// Set when the session store could not be reached; required routes
/// answer 503 instead of 401
#[derive(Debug, Clone, Copy)]
struct AuthUnavailable;

/// The token the current session was proven with
#[derive(Debug, Clone)]
struct PresentedToken {
    token: String,
    from_cookie: bool,
}

/// Error response for API errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    /// Every authentication failure uses this one body
    pub fn unauthorized() -> Self {
        Self::new("UNAUTHORIZED", "Authentication required")
    }

    pub fn invalid_credentials() -> Self {
        Self::new("UNAUTHORIZED", "Invalid username or password")
    }

    pub fn too_many_requests(retry_after: std::time::Duration) -> Self {
        Self::with_details(
            "RATE_LIMIT",
            "Too many attempts, try again later",
            serde_json::json!({ "retry_after": retry_after.as_secs() }),
        )
    }

    pub fn unavailable() -> Self {
        Self::new("SERVICE_UNAVAILABLE", "Authentication temporarily unavailable")
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.error.code.as_str() {
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "RATE_LIMIT" => StatusCode::TOO_MANY_REQUESTS,
            "SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        tracing::error!(error = %e, "Session store failure");
        Self::unavailable()
    }
}

impl From<AuthTokenError> for ApiError {
    fn from(e: AuthTokenError) -> Self {
        match e {
            AuthTokenError::InvalidToken => Self::unauthorized(),
            AuthTokenError::TooManyAttempts { retry_after } => Self::too_many_requests(retry_after),
            AuthTokenError::Store(e) => {
                tracing::error!(error = %e, "Auth token store failure");
                Self::unavailable()
            }
        }
    }
}

impl From<UserServiceError> for ApiError {
    fn from(e: UserServiceError) -> Self {
        match e {
            UserServiceError::InvalidCredentials => Self::invalid_credentials(),
            UserServiceError::ValidationError(msg) => Self::validation_error(msg),
            UserServiceError::UserExists(msg) => Self::validation_error(msg),
            UserServiceError::InternalError(e) => {
                tracing::error!(error = %e, "User store failure");
                Self::unavailable()
            }
        }
    }
}

/// Extract session token from request.
///
/// A bearer token is used as is; the cookie must carry a valid signature.
fn extract_session_token(state: &AppState, headers: &HeaderMap) -> Option<PresentedToken> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(PresentedToken {
            token: token.trim().to_string(),
            from_cookie: false,
        });
    }

    let signed = get_cookie(headers, &state.auth.session_cookie)?;
    let Some(token) = state.signer.verify(signed) else {
        tracing::debug!("Session cookie signature rejected");
        return None;
    };
    Some(PresentedToken {
        token: token.to_string(),
        from_cookie: true,
    })
}

/// Client address used to key the remember-me limiter.
///
/// Proxy headers are only read when `trust_proxy` is set; otherwise the
/// socket address is used.
pub fn client_ip(request: &Request, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = forwarded_ip(request.headers()) {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(ip.to_string());
    }

    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// Resolve the caller's session, falling back to the remember-me cookie.
///
/// Cookie clients left without a session get a fresh anonymous one. Never
/// rejects on its own except when the caller's IP has exhausted its
/// remember-me attempts.
pub async fn session_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let presented = extract_session_token(&state, request.headers());
    let bearer = presented.as_ref().is_some_and(|p| !p.from_cookie);
    let mut set_cookies = Vec::new();
    let mut clear_session_cookie = false;
    let mut unavailable = false;

    let mut session = None;
    if let Some(presented) = &presented {
        match state.sessions.validate_session_token(&presented.token).await {
            Ok(found) => session = found,
            Err(e) => {
                tracing::warn!(error = %e, "Session validation failed, continuing unauthenticated");
                unavailable = true;
            }
        }
    }
    let mut proven = session.is_some().then(|| presented.clone()).flatten();

    if session.is_none() && !unavailable {
        if let Some(auth_cookie) = get_cookie(request.headers(), &state.auth.auth_cookie) {
            let ip = client_ip(&request, state.trust_proxy);
            // An unproven session id is never trusted, so nothing is replaced
            match state
                .auth_tokens
                .authenticate_by_auth_cookie(auth_cookie, &ip, None)
                .await
            {
                Ok(AuthCookieOutcome::Authenticated {
                    session: restored,
                    issued_session,
                    auth_token,
                }) => {
                    set_cookies.push(state.session_cookie(&issued_session.token, issued_session.expires_at));
                    set_cookies.push(state.auth_cookie(&auth_token.token, auth_token.expires_at));
                    proven = Some(PresentedToken {
                        token: issued_session.token,
                        from_cookie: true,
                    });
                    session = Some(restored);
                }
                Ok(AuthCookieOutcome::Rejected | AuthCookieOutcome::Revoked { .. })
                | Err(AuthTokenError::InvalidToken) => {
                    set_cookies.push(clear_cookie(&state.auth.auth_cookie, state.auth.secure_cookies));
                    clear_session_cookie = true;
                }
                Err(AuthTokenError::TooManyAttempts { retry_after }) => {
                    return ApiError::too_many_requests(retry_after).into_response();
                }
                Err(AuthTokenError::Store(e)) => {
                    tracing::warn!(error = %e, "Remember-me check failed, continuing unauthenticated");
                    unavailable = true;
                }
            }
        } else if presented.as_ref().is_some_and(|p| p.from_cookie) {
            clear_session_cookie = true;
        }
    }

    let mut current = session.map(SessionContext::from);

    if current.is_none() && !unavailable && !bearer {
        match state.sessions.create_session(None).await {
            Ok(issued) => {
                set_cookies.push(state.session_cookie(&issued.token, issued.expires_at));
                clear_session_cookie = false;
                current = Some(SessionContext {
                    session_id: issued.session_id,
                    user_id: None,
                    expires_at: issued.expires_at,
                    data: None,
                });
                proven = Some(PresentedToken {
                    token: issued.token,
                    from_cookie: true,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Anonymous session not issued, continuing without one");
                unavailable = true;
            }
        }
    }

    if clear_session_cookie {
        set_cookies.push(clear_cookie(&state.auth.session_cookie, state.auth.secure_cookies));
    }

    if let Some(context) = current {
        if let Some(user_id) = context.user_id {
            match state.users.get_user(user_id).await {
                Ok(Some(user)) => {
                    request.extensions_mut().insert(AuthenticatedUser(user));
                }
                Ok(None) => tracing::warn!(user_id, "Session bound to missing user"),
                Err(e) => {
                    tracing::warn!(error = %e, "User lookup failed");
                    unavailable = true;
                }
            }
        }
        request.extensions_mut().insert(CurrentSession(context));
        if let Some(proven) = proven {
            request.extensions_mut().insert(proven);
        }
    }

    if unavailable {
        request.extensions_mut().insert(AuthUnavailable);
    }

    let mut response = next.run(request).await;
    append_set_cookies(response.headers_mut(), &set_cookies);
    response
}

/// Extend sessions whose remaining lifetime has dropped below the touch
/// threshold, and re-issue their cookie.
pub async fn sliding_expiration(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let now = state.sessions.clock().now();
    let mut refreshed = None;

    if let Some(CurrentSession(context)) = request.extensions().get::<CurrentSession>().cloned() {
        if context.expires_at - now < state.auth.touch_threshold() {
            let expires_at = now + state.sessions.ttl();
            match state
                .sessions
                .update_session(&context.session_id, SessionUpdate::expires_at(expires_at))
                .await
            {
                Ok(true) => {
                    tracing::debug!("Session expiry extended");
                    let presented = request.extensions().get::<PresentedToken>().cloned();
                    if let Some(CurrentSession(current)) = request.extensions_mut().get_mut::<CurrentSession>() {
                        current.expires_at = expires_at;
                    }
                    refreshed = presented
                        .filter(|p| p.from_cookie)
                        .map(|p| state.session_cookie(&p.token, expires_at));
                }
                Ok(false) => tracing::debug!("Session vanished before extension"),
                Err(e) => tracing::warn!(error = %e, "Failed to extend session"),
            }
        }
    }

    let mut response = next.run(request).await;
    if let Some(cookie) = refreshed {
        append_set_cookies(response.headers_mut(), &[cookie]);
    }
    response
}

/// Authentication middleware
pub async fn require_auth(request: Request, next: Next) -> Result<Response, ApiError> {
    if request.extensions().get::<AuthenticatedUser>().is_some() {
        return Ok(next.run(request).await);
    }
    if request.extensions().get::<AuthUnavailable>().is_some() {
        return Err(ApiError::unavailable());
    }
    Err(ApiError::unauthorized())
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(ApiError::unauthorized)
    }
}

impl<S> FromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentSession>()
            .cloned()
            .ok_or_else(ApiError::unauthorized)
    }
}

impl<S> OptionalFromRequestParts<S> for CurrentSession
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Option<Self>, Self::Rejection> {
        Ok(parts.extensions.get::<CurrentSession>().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_api_error_status_codes() {
        let cases = [
            (ApiError::unauthorized(), StatusCode::UNAUTHORIZED),
            (ApiError::invalid_credentials(), StatusCode::UNAUTHORIZED),
            (ApiError::too_many_requests(std::time::Duration::from_secs(60)), StatusCode::TOO_MANY_REQUESTS),
            (ApiError::unavailable(), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::validation_error("bad"), StatusCode::BAD_REQUEST),
            (ApiError::new("INTERNAL_ERROR", "boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_auth_token_errors_share_unauthorized_body() {
        let error = ApiError::from(AuthTokenError::InvalidToken);
        assert_eq!(error.error.code, "UNAUTHORIZED");
        assert_eq!(error.error.message, ApiError::unauthorized().error.message);
    }

    #[test]
    fn test_client_ip_reads_proxy_headers_when_trusted() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, true), "203.0.113.7");

        let mut request = Request::builder()
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(client_ip(&request, true), "198.51.100.2");

        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_ip(&request, true), "unknown");
    }

    #[test]
    fn test_client_ip_ignores_spoofed_headers_when_untrusted() {
        let mut request = Request::builder()
            .header("x-forwarded-for", "203.0.113.7")
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));
        assert_eq!(client_ip(&request, false), "192.0.2.1");

        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, false), "unknown");
    }
}
