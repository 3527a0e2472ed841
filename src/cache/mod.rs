//! Cache layer
//!
//! Two bounded in-memory caches sit in front of the database:
//! - `SessionCache`, keyed by session id
//! - `UserCache`, keyed by user id, used to resolve the user behind a session
//!
//! Both are advisory. A miss only means "ask the store"; it never means the
//! row is absent.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tessera::cache::SessionCache;
//! use tessera::config::CacheConfig;
//!
//! let cache = SessionCache::from_config(&CacheConfig::default());
//! let generation = cache.generation();
//! let session = repo.find_by_id(&id).await?;
//! if let Some(ttl) = cache.ttl_for(&session, now) {
//!     cache.fill(&session.id, session.clone(), ttl, generation).await;
//! }
//! ```

pub mod memory;

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::models::{Session, User};

pub use memory::MemoryCache;

/// Session cache keyed by session id
///
/// Entries never outlive the session they hold: callers derive the TTL with
/// [`SessionCache::ttl_for`], which caps it at the session's remaining life.
///
/// Every invalidation bumps a generation counter. A reader that loaded a row
/// from the store fills the cache through [`SessionCache::fill`] with the
/// generation it saw before the read, so a row deleted while the read was in
/// flight is never cached.
#[derive(Debug)]
pub struct SessionCache {
    inner: MemoryCache<String, Session>,
    generation: AtomicU64,
}

impl SessionCache {
    pub fn new(max_capacity: u64, max_ttl: Duration) -> Self {
        Self {
            inner: MemoryCache::with_capacity_and_ttl(max_capacity, max_ttl),
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.session_capacity,
            Duration::from_secs(config.session_ttl_seconds),
        )
    }

    /// TTL to cache `session` with at `now`, or `None` if it is already expired
    pub fn ttl_for(&self, session: &Session, now: DateTime<Utc>) -> Option<Duration> {
        let remaining = (session.expires_at - now).to_std().ok()?;
        let ttl = remaining.min(self.inner.max_ttl());
        (!ttl.is_zero()).then_some(ttl)
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner.get(id).await
    }

    /// Insert unconditionally. Readers racing invalidations use
    /// [`SessionCache::fill`].
    pub async fn set(&self, id: &str, session: Session, ttl: Duration) {
        self.inner.set(id.to_string(), session, ttl).await;
    }

    /// Current invalidation generation. Snapshot it before reading the store.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cache a row read from the store, unless an invalidation happened
    /// since `generation` was taken. Returns whether the entry was kept.
    pub async fn fill(&self, id: &str, session: Session, ttl: Duration, generation: u64) -> bool {
        if self.generation() != generation {
            return false;
        }
        self.set(id, session, ttl).await;

        // An invalidation that raced the insert may have run its delete first
        if self.generation() != generation {
            self.inner.delete(id).await;
            return false;
        }
        true
    }

    /// Drop one entry. Call after the store write.
    pub async fn delete(&self, id: &str) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(id).await;
    }

    /// Purge every cached session matching `predicate`. Call after the
    /// store write.
    pub async fn delete_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_where(|_, session| predicate(session)).await
    }
}

/// LRU of users resolved by the request middleware
#[derive(Debug)]
pub struct UserCache {
    inner: MemoryCache<i64, User>,
    ttl: Duration,
}

impl UserCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: MemoryCache::with_capacity_and_ttl(max_capacity, ttl),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.user_capacity, Duration::from_secs(config.user_ttl_seconds))
    }

    pub async fn get(&self, user_id: i64) -> Option<User> {
        self.inner.get(&user_id).await
    }

    pub async fn set(&self, user: User) {
        self.inner.set(user.id, user, self.ttl).await;
    }
}

/// Build both caches from configuration
pub fn create_caches(config: &CacheConfig) -> (Arc<SessionCache>, Arc<UserCache>) {
    (
        Arc::new(SessionCache::from_config(config)),
        Arc::new(UserCache::from_config(config)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserRole;
    use chrono::Duration as ChronoDuration;

    fn session(id: &str, user_id: Option<i64>, expires_at: DateTime<Utc>) -> Session {
        Session {
            id: id.to_string(),
            user_id,
            secret_hash: vec![0; 32],
            expires_at,
            data: None,
            created_at: expires_at - ChronoDuration::hours(2),
        }
    }

    #[test]
    fn test_ttl_capped_by_session_expiry() {
        let cache = SessionCache::new(10, Duration::from_secs(600));
        let now = Utc::now();

        let soon = session("a", None, now + ChronoDuration::seconds(30));
        assert_eq!(cache.ttl_for(&soon, now), Some(Duration::from_secs(30)));

        let later = session("b", None, now + ChronoDuration::hours(2));
        assert_eq!(cache.ttl_for(&later, now), Some(Duration::from_secs(600)));

        let expired = session("c", None, now);
        assert_eq!(cache.ttl_for(&expired, now), None);
        let long_gone = session("d", None, now - ChronoDuration::hours(1));
        assert_eq!(cache.ttl_for(&long_gone, now), None);
    }

    #[tokio::test]
    async fn test_session_cache_delete_where_by_user() {
        let cache = SessionCache::new(10, Duration::from_secs(600));
        let expires_at = Utc::now() + ChronoDuration::hours(2);
        for (id, user_id) in [("s1", Some(1)), ("s2", Some(1)), ("s3", Some(2)), ("s4", None)] {
            cache
                .set(id, session(id, user_id, expires_at), Duration::from_secs(60))
                .await;
        }

        let removed = cache.delete_where(|s| s.user_id == Some(1)).await;

        assert_eq!(removed, 2);
        assert!(cache.get("s1").await.is_none());
        assert!(cache.get("s2").await.is_none());
        assert!(cache.get("s3").await.is_some());
        assert!(cache.get("s4").await.is_some());
    }

    #[tokio::test]
    async fn test_fill_skipped_after_invalidation() {
        let cache = SessionCache::new(10, Duration::from_secs(600));
        let expires_at = Utc::now() + ChronoDuration::hours(2);

        let before = cache.generation();
        assert!(cache.fill("s1", session("s1", Some(1), expires_at), Duration::from_secs(60), before).await);
        assert!(cache.get("s1").await.is_some());

        // A reader that started before this purge must not repopulate
        let stale = cache.generation();
        cache.delete_where(|s| s.user_id == Some(1)).await;
        assert!(!cache.fill("s1", session("s1", Some(1), expires_at), Duration::from_secs(60), stale).await);
        assert!(cache.get("s1").await.is_none());

        let stale = cache.generation();
        cache.delete("s2").await;
        assert!(!cache.fill("s2", session("s2", None, expires_at), Duration::from_secs(60), stale).await);
        assert!(cache.get("s2").await.is_none());

        let fresh = cache.generation();
        assert!(cache.fill("s2", session("s2", None, expires_at), Duration::from_secs(60), fresh).await);
        assert!(cache.get("s2").await.is_some());
    }

    #[tokio::test]
    async fn test_user_cache_roundtrip() {
        let cache = UserCache::new(10, Duration::from_secs(60));
        let mut user = User::new(
            "alice".to_string(),
            "alice@example.com".to_string(),
            "hash".to_string(),
            UserRole::Author,
        );
        user.id = 7;

        cache.set(user.clone()).await;
        assert_eq!(cache.get(7).await.map(|u| u.uuid), Some(user.uuid));
        assert!(cache.get(8).await.is_none());
    }
}
