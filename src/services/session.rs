//! Session service
//!
//! Issues, validates and rotates session tokens, and owns the session cache.
//!
//! A session moves through `Active` (optionally touched forward) and ends
//! either `Expired` (sweeper or lazy delete at validation time) or `Revoked`
//! (explicit delete or bulk clear). Every mutation of a row invalidates its
//! cache entry, so the cache never serves a session the store no longer
//! holds.

use crate::cache::SessionCache;
use crate::db::repositories::SessionRepository;
use crate::models::{IssuedSession, Session, SessionContext, SessionUpdate};
use crate::services::clock::DynClock;
use crate::services::secret::{
    constant_time_eq, generate_id, generate_secret, hash_secret, SessionToken, SECRET_BYTES,
    SESSION_ID_BYTES,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

/// Default session lifetime (2 hours)
pub const DEFAULT_SESSION_TTL_SECONDS: i64 = 2 * 60 * 60;

/// Error types for session operations
///
/// "Not authenticated" is never an error: those paths return `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The store could not be reached or rejected the query
    #[error("Session store unavailable: {0}")]
    Store(#[from] anyhow::Error),
}

/// Callback run once for every session that is deleted individually or by
/// the sweeper. Bulk revocation through `clear_user_sessions` skips it.
///
/// It is called after the row is gone from the store. Failures are logged
/// and never reach the caller.
#[async_trait]
pub trait SessionExpiryHook: Send + Sync {
    async fn on_expire(&self, session: &SessionContext) -> anyhow::Result<()>;
}

/// Hook that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExpiryHook;

#[async_trait]
impl SessionExpiryHook for NoopExpiryHook {
    async fn on_expire(&self, _session: &SessionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Session service
pub struct SessionManager {
    repo: Arc<dyn SessionRepository>,
    cache: Arc<SessionCache>,
    hook: Arc<dyn SessionExpiryHook>,
    clock: DynClock,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        cache: Arc<SessionCache>,
        hook: Arc<dyn SessionExpiryHook>,
        clock: DynClock,
        ttl: Duration,
    ) -> Self {
        Self {
            repo,
            cache,
            hook,
            clock,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn clock(&self) -> &DynClock {
        &self.clock
    }

    /// Issue a new session, anonymous when `user_id` is `None`.
    ///
    /// The cache is not populated here; the first read fills it.
    pub async fn create_session(&self, user_id: Option<i64>) -> Result<IssuedSession, SessionError> {
        let session_id = generate_id(SESSION_ID_BYTES)?;
        let secret = generate_secret(SECRET_BYTES)?;
        let now = self.clock.now();

        let session = Session {
            id: session_id.clone(),
            user_id,
            secret_hash: hash_secret(&secret),
            expires_at: now + self.ttl,
            data: None,
            created_at: now,
        };

        self.repo
            .insert(&session)
            .await
            .context("Failed to create session")?;

        tracing::debug!(
            session = %id_prefix(&session_id),
            anonymous = user_id.is_none(),
            "Session created"
        );

        Ok(IssuedSession {
            token: SessionToken::format(&session_id, &secret),
            session_id,
            expires_at: session.expires_at,
        })
    }

    /// Resolve a client token to its session.
    ///
    /// Malformed tokens return `None` without touching the store. A secret
    /// mismatch returns `None` and leaves the session alone. An expired
    /// session is deleted (running the expiry hook) and `None` is returned.
    pub async fn validate_session_token(&self, token: &str) -> Result<Option<Session>, SessionError> {
        let Some(parsed) = SessionToken::parse(token) else {
            tracing::debug!("Malformed session token");
            return Ok(None);
        };

        let Some(session) = self.get_session(&parsed.session_id, true).await? else {
            tracing::debug!(session = %id_prefix(&parsed.session_id), "Unknown session id");
            return Ok(None);
        };

        if !constant_time_eq(&hash_secret(&parsed.secret), &session.secret_hash) {
            tracing::warn!(session = %id_prefix(&session.id), "Session secret mismatch");
            return Ok(None);
        }

        if session.is_expired_at(self.clock.now()) {
            tracing::debug!(session = %id_prefix(&session.id), "Session expired");
            self.delete_session(&session.id).await?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Cache-first lookup by id, for callers that already trust the id.
    ///
    /// With `use_cache` false the cache is neither read nor filled.
    pub async fn get_session(&self, id: &str, use_cache: bool) -> Result<Option<Session>, SessionError> {
        if use_cache {
            if let Some(session) = self.cache.get(id).await {
                return Ok(Some(session));
            }
        }

        let generation = self.cache.generation();
        let session = self
            .repo
            .find_by_id(id)
            .await
            .context("Failed to get session")?;

        if use_cache {
            if let Some(session) = &session {
                if let Some(ttl) = self.cache.ttl_for(session, self.clock.now()) {
                    if !self.cache.fill(id, session.clone(), ttl, generation).await {
                        tracing::debug!(
                            session = %id_prefix(id),
                            "Skipped caching a session invalidated mid-read"
                        );
                    }
                }
            }
        }

        Ok(session)
    }

    /// Apply a partial update and drop the cache entry.
    ///
    /// Returns false if the session no longer exists.
    pub async fn update_session(&self, id: &str, update: SessionUpdate) -> Result<bool, SessionError> {
        let result = self.repo.update_by_id(id, &update).await;
        self.cache.delete(id).await;

        Ok(result.context("Failed to update session")?)
    }

    /// Delete a session and run the expiry hook if a row was removed.
    pub async fn delete_session(&self, id: &str) -> Result<bool, SessionError> {
        let deleted = self.repo.delete_by_id(id).await;
        self.cache.delete(id).await;

        match deleted.context("Failed to delete session")? {
            Some(session) => {
                self.notify_expired(&SessionContext::from(session)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Revoke every session of a user without running the expiry hook.
    pub async fn clear_user_sessions(&self, user_id: i64) -> Result<u64, SessionError> {
        let deleted = self.repo.delete_by_user(user_id).await;
        let purged = self
            .cache
            .delete_where(|session| session.user_id == Some(user_id))
            .await;

        let deleted = deleted.context("Failed to clear user sessions")?;
        tracing::info!(user_id, deleted, purged, "Cleared user sessions");
        Ok(deleted)
    }

    /// Replace `old_id` (if any) with a fresh session for `user_id`.
    ///
    /// Used after privilege changes such as login to defeat fixation.
    pub async fn regenerate_session(
        &self,
        old_id: Option<&str>,
        user_id: Option<i64>,
    ) -> Result<IssuedSession, SessionError> {
        if let Some(old_id) = old_id {
            self.delete_session(old_id).await?;
        }
        self.create_session(user_id).await
    }

    /// Bulk-delete every expired session, purge the cache, then run the
    /// expiry hook once per removed row. Returns the number removed.
    pub async fn delete_expired_sessions(&self) -> Result<usize, SessionError> {
        let expired = self
            .repo
            .delete_expired(self.clock.now())
            .await
            .context("Failed to delete expired sessions")?;

        for session in &expired {
            self.cache.delete(&session.id).await;
        }

        for session in &expired {
            self.notify_expired(&SessionContext::from(session)).await;
        }

        Ok(expired.len())
    }

    async fn notify_expired(&self, context: &SessionContext) {
        if let Err(e) = self.hook.on_expire(context).await {
            tracing::warn!(
                session = %id_prefix(&context.session_id),
                error = %e,
                "Session expiry hook failed"
            );
        }
    }
}

/// Loggable prefix of an identifier
pub(crate) fn id_prefix(id: &str) -> String {
    id.chars().take(8).collect()
}
