//! Remember-me tokens
//!
//! Long-lived tokens that re-establish a session without a password. Each
//! successful use rotates the token, so a cookie is good for exactly one
//! login between rotations.
//!
//! A lookup that matches but a secret that does not is read as theft or
//! replay: every session and token of that user is revoked and the caller's
//! IP is charged one brute-force point.

use crate::db::repositories::AuthTokenRepository;
use crate::models::{AuthToken, IssuedAuthToken, IssuedSession, Session};
use crate::services::clock::DynClock;
use crate::services::rate_limiter::AttemptLimiter;
use crate::services::secret::{
    constant_time_eq, generate_id, generate_secret, hash_secret, RememberToken, LOOKUP_BYTES,
    SECRET_BYTES,
};
use crate::services::session::{id_prefix, SessionError, SessionManager};
use anyhow::Context;
use chrono::Duration;
use std::sync::Arc;

/// Default remember-me lifetime (30 days)
pub const DEFAULT_AUTH_TOKEN_TTL_DAYS: i64 = 30;

/// Error types for remember-me operations
#[derive(Debug, thiserror::Error)]
pub enum AuthTokenError {
    /// No row matched the presented token
    #[error("Invalid token")]
    InvalidToken,

    /// The caller's IP has used up its attempts
    #[error("Too many attempts, retry after {retry_after:?}")]
    TooManyAttempts { retry_after: std::time::Duration },

    /// The store could not be reached or rejected the query
    #[error("Auth token store unavailable: {0}")]
    Store(#[from] anyhow::Error),
}

impl From<SessionError> for AuthTokenError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Store(e) => AuthTokenError::Store(e),
        }
    }
}

/// What the HTTP layer must do after a remember-me attempt
#[derive(Debug, Clone)]
pub enum AuthCookieOutcome {
    /// Token accepted: set both new cookies
    Authenticated {
        session: Session,
        issued_session: IssuedSession,
        auth_token: IssuedAuthToken,
    },
    /// Token unusable: clear the auth cookie and forget the session cookie
    Rejected,
    /// Token looked stolen or replayed: the user was revoked everywhere
    Revoked { user_id: i64 },
}

impl AuthCookieOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthCookieOutcome::Authenticated { .. })
    }
}

/// Remember-me token service
pub struct AuthTokenManager {
    repo: Arc<dyn AuthTokenRepository>,
    sessions: Arc<SessionManager>,
    brute_force: Arc<dyn AttemptLimiter>,
    clock: DynClock,
    ttl: Duration,
}

impl AuthTokenManager {
    pub fn new(
        repo: Arc<dyn AuthTokenRepository>,
        sessions: Arc<SessionManager>,
        brute_force: Arc<dyn AttemptLimiter>,
        clock: DynClock,
        ttl: Duration,
    ) -> Self {
        Self {
            repo,
            sessions,
            brute_force,
            clock,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new remember-me token for a user
    pub async fn generate_auth_token(
        &self,
        user_id: i64,
        user_uuid: &str,
    ) -> Result<IssuedAuthToken, AuthTokenError> {
        let lookup = generate_id(LOOKUP_BYTES)?;
        let secret = generate_secret(SECRET_BYTES)?;
        let expires_at = self.clock.now() + self.ttl;

        self.repo
            .insert(&AuthToken {
                user_id,
                lookup: lookup.clone(),
                token_hash: hash_secret(&secret),
                expires_at,
            })
            .await
            .context("Failed to create auth token")?;

        tracing::debug!(user_id, lookup = %id_prefix(&lookup), "Auth token issued");

        Ok(IssuedAuthToken {
            token: RememberToken::format(&lookup, &secret, user_uuid),
            lookup,
            expires_at,
        })
    }

    /// Rotate the token identified by `(user_id, lookup)`.
    ///
    /// Fails with `InvalidToken` if the row is gone, including when a
    /// concurrent request rotated it first.
    pub async fn regenerate_auth_token(
        &self,
        user_id: i64,
        lookup: &str,
        user_uuid: &str,
    ) -> Result<IssuedAuthToken, AuthTokenError> {
        let new_lookup = generate_id(LOOKUP_BYTES)?;
        let secret = generate_secret(SECRET_BYTES)?;
        let expires_at = self.clock.now() + self.ttl;

        let rotated = self
            .repo
            .rotate(user_id, lookup, &new_lookup, &hash_secret(&secret), expires_at)
            .await
            .context("Failed to rotate auth token")?;

        if !rotated {
            return Err(AuthTokenError::InvalidToken);
        }

        Ok(IssuedAuthToken {
            token: RememberToken::format(&new_lookup, &secret, user_uuid),
            lookup: new_lookup,
            expires_at,
        })
    }

    /// Authenticate a request that has no valid session but carries a
    /// remember-me cookie.
    ///
    /// `current_session_id` is the session the request arrived with, if
    /// any; it is replaced on success and deleted on revocation.
    pub async fn authenticate_by_auth_cookie(
        &self,
        cookie: &str,
        client_ip: &str,
        current_session_id: Option<&str>,
    ) -> Result<AuthCookieOutcome, AuthTokenError> {
        if let Err(retry_after) = self.brute_force.check(client_ip).await {
            tracing::warn!(client_ip, ?retry_after, "Remember-me attempts exhausted");
            return Err(AuthTokenError::TooManyAttempts { retry_after });
        }

        let Some(presented) = RememberToken::parse(cookie) else {
            tracing::debug!(client_ip, "Malformed auth cookie");
            return Ok(AuthCookieOutcome::Rejected);
        };

        let token = self
            .repo
            .find_by_user_uuid_and_lookup(&presented.user_uuid, &presented.lookup)
            .await
            .context("Failed to get auth token")?;

        let Some(token) = token else {
            tracing::debug!(lookup = %id_prefix(&presented.lookup), "Unknown auth token");
            return Ok(AuthCookieOutcome::Rejected);
        };

        if !constant_time_eq(&hash_secret(&presented.secret), &token.token_hash) {
            tracing::warn!(
                user_id = token.user_id,
                client_ip,
                "Auth token secret mismatch, revoking all sessions"
            );
            return self.revoke_after_misuse(token.user_id, client_ip, current_session_id).await;
        }

        if token.is_expired_at(self.clock.now()) {
            tracing::debug!(user_id = token.user_id, "Auth token expired");
            self.repo
                .delete_by_lookup(token.user_id, &token.lookup)
                .await
                .context("Failed to delete expired auth token")?;
            return Ok(AuthCookieOutcome::Rejected);
        }

        let auth_token = match self
            .regenerate_auth_token(token.user_id, &token.lookup, &presented.user_uuid)
            .await
        {
            Ok(auth_token) => auth_token,
            Err(AuthTokenError::InvalidToken) => {
                tracing::warn!(
                    user_id = token.user_id,
                    client_ip,
                    "Auth token rotated concurrently, revoking all sessions"
                );
                return self.revoke_after_misuse(token.user_id, client_ip, current_session_id).await;
            }
            Err(e) => return Err(e),
        };

        let issued_session = self
            .sessions
            .regenerate_session(current_session_id, Some(token.user_id))
            .await?;

        // Revocation deletes tokens before sessions, so while the rotated
        // token exists any revocation still to come will also see this session
        let still_issued = self
            .repo
            .find_by_user_uuid_and_lookup(&presented.user_uuid, &auth_token.lookup)
            .await
            .context("Failed to get auth token")?;
        if still_issued.is_none() {
            tracing::warn!(user_id = token.user_id, "User revoked while restoring session");
            self.sessions.delete_session(&issued_session.session_id).await?;
            return Ok(AuthCookieOutcome::Rejected);
        }

        let Some(session) = self
            .sessions
            .get_session(&issued_session.session_id, true)
            .await?
        else {
            tracing::warn!(user_id = token.user_id, "User revoked while restoring session");
            return Ok(AuthCookieOutcome::Rejected);
        };

        tracing::info!(user_id = token.user_id, "Session restored from auth token");

        Ok(AuthCookieOutcome::Authenticated {
            session,
            issued_session,
            auth_token,
        })
    }

    /// Revoke every session and remember-me token of a user.
    ///
    /// Used on suspected theft and on logout from all devices. Tokens go
    /// first so a restore racing with this call cannot keep its session.
    pub async fn revoke_user(&self, user_id: i64) -> Result<(), AuthTokenError> {
        let tokens = self
            .repo
            .delete_by_user(user_id)
            .await
            .context("Failed to delete auth tokens");
        let sessions = self.sessions.clear_user_sessions(user_id).await;

        let sessions = sessions?;
        let tokens = tokens?;
        tracing::info!(user_id, sessions, tokens, "Revoked all credentials for user");
        Ok(())
    }

    /// Delete the token behind a remember-me cookie, for plain logout.
    ///
    /// Returns false if the cookie does not resolve to a stored token.
    pub async fn delete_auth_token(&self, cookie: &str) -> Result<bool, AuthTokenError> {
        let Some(presented) = RememberToken::parse(cookie) else {
            return Ok(false);
        };

        let token = self
            .repo
            .find_by_user_uuid_and_lookup(&presented.user_uuid, &presented.lookup)
            .await
            .context("Failed to get auth token")?;

        match token {
            Some(token) if constant_time_eq(&hash_secret(&presented.secret), &token.token_hash) => {
                Ok(self
                    .repo
                    .delete_by_lookup(token.user_id, &token.lookup)
                    .await
                    .context("Failed to delete auth token")?)
            }
            _ => Ok(false),
        }
    }

    /// Delete expired tokens. Returns the number removed.
    pub async fn delete_expired_tokens(&self) -> Result<u64, AuthTokenError> {
        Ok(self
            .repo
            .delete_expired(self.clock.now())
            .await
            .context("Failed to delete expired auth tokens")?)
    }

    async fn revoke_after_misuse(
        &self,
        user_id: i64,
        client_ip: &str,
        current_session_id: Option<&str>,
    ) -> Result<AuthCookieOutcome, AuthTokenError> {
        self.brute_force.consume(client_ip).await;

        if let Some(session_id) = current_session_id {
            self.sessions.delete_session(session_id).await?;
        }
        self.revoke_user(user_id).await?;

        Ok(AuthCookieOutcome::Revoked { user_id })
    }
}
