//! In-memory cache implementation using moka
//!
//! Provides a bounded, thread-safe in-memory cache with per-entry TTL.
//!
//! # Features
//! - Each entry carries its own time-to-live, capped by the cache-wide maximum
//! - Predicate-based bulk deletion
//! - Thread-safe concurrent access

use moka::future::Cache;
use moka::Expiry;
use std::borrow::Borrow;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Cached value together with the TTL it was inserted with
#[derive(Clone)]
struct CacheEntry<V> {
    value: V,
    ttl: Duration,
}

/// Expiry policy reading the TTL stored on each entry.
///
/// An overwrite restarts the clock with the new entry's TTL; reads do not
/// extend it.
struct EntryTtl;

impl<K, V> Expiry<K, CacheEntry<V>> for EntryTtl {
    fn expire_after_create(&self, _key: &K, entry: &CacheEntry<V>, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        entry: &CacheEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-memory cache using moka
///
/// Values are stored as-is (no serialization); `V` is cloned out on reads.
pub struct MemoryCache<K, V> {
    /// The underlying moka cache instance
    cache: Cache<K, CacheEntry<V>>,
    /// Longest TTL any entry may be given
    max_ttl: Duration,
}

impl<K, V> std::fmt::Debug for MemoryCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entry_count", &self.cache.entry_count())
            .field("max_ttl", &self.max_ttl)
            .finish()
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a new memory cache with custom capacity and TTL cap
    ///
    /// # Arguments
    /// * `max_capacity` - Maximum number of entries the cache can hold
    /// * `max_ttl` - Upper bound applied to every entry's time-to-live
    pub fn with_capacity_and_ttl(max_capacity: u64, max_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(EntryTtl)
            .build();

        Self { cache, max_ttl }
    }

    /// Get the TTL cap for this cache
    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    /// Get a value from cache
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    pub async fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.cache.get(key).await.map(|entry| entry.value)
    }

    /// Set a value with the given TTL, capped at `max_ttl`
    ///
    /// A zero TTL removes any existing entry instead of inserting.
    pub async fn set(&self, key: K, value: V, ttl: Duration) {
        let ttl = ttl.min(self.max_ttl);
        if ttl.is_zero() {
            self.cache.invalidate(&key).await;
            return;
        }
        self.cache.insert(key, CacheEntry { value, ttl }).await;
    }

    /// Delete a value from cache
    ///
    /// If the key doesn't exist, this is a no-op.
    pub async fn delete<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.cache.invalidate(key).await;
    }

    /// Delete every entry matching `predicate`, returning how many were removed
    ///
    /// This walks the whole cache, so it is meant for rare bulk revocations.
    pub async fn delete_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K, &V) -> bool,
        K: Clone,
    {
        let keys_to_delete: Vec<K> = self
            .cache
            .iter()
            .filter(|(key, entry)| predicate(key.as_ref(), &entry.value))
            .map(|(key, _)| (*key).clone())
            .collect();

        let count = keys_to_delete.len();
        for key in keys_to_delete {
            self.cache.invalidate(&key).await;
        }
        count
    }

    /// Flush moka's internal maintenance queue
    #[cfg(test)]
    pub(crate) async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_cache() -> MemoryCache<String, String> {
        MemoryCache::with_capacity_and_ttl(100, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = string_cache();

        cache.set("key1".to_string(), "value1".to_string(), Duration::from_secs(60)).await;

        assert_eq!(cache.get("key1").await, Some("value1".to_string()));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let cache = string_cache();
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = string_cache();
        cache.set("key1".to_string(), "value1".to_string(), Duration::from_secs(60)).await;

        cache.delete("key1").await;
        cache.delete("never-set").await;

        assert_eq!(cache.get("key1").await, None);
    }

    #[tokio::test]
    async fn test_overwrite_existing_key() {
        let cache = string_cache();
        cache.set("key".to_string(), "old".to_string(), Duration::from_secs(60)).await;
        cache.set("key".to_string(), "new".to_string(), Duration::from_secs(60)).await;

        assert_eq!(cache.get("key").await, Some("new".to_string()));
    }

    #[tokio::test]
    async fn test_zero_ttl_removes_entry() {
        let cache = string_cache();
        cache.set("key".to_string(), "value".to_string(), Duration::from_secs(60)).await;
        cache.set("key".to_string(), "other".to_string(), Duration::ZERO).await;

        assert_eq!(cache.get("key").await, None);
    }

    #[tokio::test]
    async fn test_per_entry_ttl_expires() {
        let cache = string_cache();
        cache.set("short".to_string(), "a".to_string(), Duration::from_millis(20)).await;
        cache.set("long".to_string(), "b".to_string(), Duration::from_secs(60)).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.run_pending_tasks().await;

        assert_eq!(cache.get("short").await, None);
        assert_eq!(cache.get("long").await, Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_ttl_capped_at_max() {
        let cache: MemoryCache<String, String> =
            MemoryCache::with_capacity_and_ttl(100, Duration::from_millis(20));
        cache.set("key".to_string(), "value".to_string(), Duration::from_secs(3600)).await;

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(cache.get("key").await, None);
    }

    #[tokio::test]
    async fn test_delete_where() {
        let cache: MemoryCache<String, i64> =
            MemoryCache::with_capacity_and_ttl(100, Duration::from_secs(60));
        for (key, owner) in [("a", 1), ("b", 1), ("c", 2)] {
            cache.set(key.to_string(), owner, Duration::from_secs(60)).await;
        }
        cache.run_pending_tasks().await;

        let removed = cache.delete_where(|_, owner| *owner == 1).await;

        assert_eq!(removed, 2);
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("c").await, Some(2));
    }
}
