//! Attempt limiters
//!
//! Provides protection against brute force attacks by:
//! - Limiting failed logins per username (5 attempts per 15 minutes)
//! - Limiting remember-me failures per IP address (100 per 24 hours)
//!
//! Callers check before doing any work and consume a point after a failure.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::services::clock::{DynClock, SystemClock};

/// Counts failed attempts per key
#[async_trait]
pub trait AttemptLimiter: Send + Sync {
    /// `Err(retry_after)` when the key has no attempts left
    async fn check(&self, key: &str) -> Result<(), std::time::Duration>;

    /// Record one failed attempt
    async fn consume(&self, key: &str);

    /// Attempts currently counted against `key`
    async fn consumed(&self, key: &str) -> u32;

    /// Forget all attempts for `key`
    async fn reset(&self, key: &str);

    /// Drop buckets whose attempts have all aged out
    async fn cleanup(&self);
}

/// Fixed-size window that slides with the clock
pub struct SlidingWindowLimiter {
    attempts: Arc<RwLock<HashMap<String, Vec<DateTime<Utc>>>>>,
    max_attempts: u32,
    window: Duration,
    clock: DynClock,
}

impl SlidingWindowLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self::with_clock(max_attempts, window, Arc::new(SystemClock))
    }

    pub fn with_clock(max_attempts: u32, window: Duration, clock: DynClock) -> Self {
        Self {
            attempts: Arc::new(RwLock::new(HashMap::new())),
            max_attempts,
            window,
            clock,
        }
    }

    /// Failed logins by username (5 attempts per 15 minutes)
    pub fn login() -> Self {
        Self::new(5, Duration::minutes(15))
    }

    fn normalize(key: &str) -> String {
        key.to_lowercase()
    }
}

#[async_trait]
impl AttemptLimiter for SlidingWindowLimiter {
    async fn check(&self, key: &str) -> Result<(), std::time::Duration> {
        let now = self.clock.now();
        let cutoff = now - self.window;

        let mut attempts = self.attempts.write().await;
        let Some(times) = attempts.get_mut(&Self::normalize(key)) else {
            return Ok(());
        };
        times.retain(|time| *time > cutoff);

        if times.len() < self.max_attempts as usize {
            return Ok(());
        }

        // Blocked until the oldest attempt still in the window ages out
        let oldest = times.iter().min().copied().unwrap_or(now);
        let retry_after = (oldest + self.window - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        Err(retry_after)
    }

    async fn consume(&self, key: &str) {
        let now = self.clock.now();
        let mut attempts = self.attempts.write().await;
        attempts.entry(Self::normalize(key)).or_default().push(now);
    }

    async fn consumed(&self, key: &str) -> u32 {
        let cutoff = self.clock.now() - self.window;
        let attempts = self.attempts.read().await;
        attempts
            .get(&Self::normalize(key))
            .map(|times| times.iter().filter(|time| **time > cutoff).count() as u32)
            .unwrap_or(0)
    }

    async fn reset(&self, key: &str) {
        let mut attempts = self.attempts.write().await;
        attempts.remove(&Self::normalize(key));
    }

    async fn cleanup(&self) {
        let cutoff = self.clock.now() - self.window;
        let mut attempts = self.attempts.write().await;
        attempts.retain(|_, times| {
            times.retain(|time| *time > cutoff);
            !times.is_empty()
        });
    }
}
