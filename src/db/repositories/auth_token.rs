//! Remember-me token repository
//!
//! Database operations for the `auth_tokens` table. Rotation is a single
//! conditional UPDATE keyed by the old `(user_id, lookup)` pair, so two
//! requests racing on the same token have exactly one winner.

use crate::db::{Backend, DynDatabasePool};
use crate::models::AuthToken;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};
use std::sync::Arc;

/// Auth token repository trait
#[async_trait]
pub trait AuthTokenRepository: Send + Sync {
    /// Insert a new token row
    async fn insert(&self, token: &AuthToken) -> Result<()>;

    /// Find a token by the owner's public UUID and the token lookup
    async fn find_by_user_uuid_and_lookup(&self, user_uuid: &str, lookup: &str) -> Result<Option<AuthToken>>;

    /// Replace lookup, hash and expiry of the row matching `(user_id, old_lookup)`.
    ///
    /// Returns false if no row matched.
    async fn rotate(
        &self,
        user_id: i64,
        old_lookup: &str,
        new_lookup: &str,
        new_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete a single token
    async fn delete_by_lookup(&self, user_id: i64, lookup: &str) -> Result<bool>;

    /// Delete all tokens for a user
    async fn delete_by_user(&self, user_id: i64) -> Result<u64>;

    /// Delete tokens expired at `now`
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// SQLx-based auth token repository implementation
pub struct SqlxAuthTokenRepository {
    pool: DynDatabasePool,
}

impl SqlxAuthTokenRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn AuthTokenRepository> {
        Arc::new(Self::new(pool))
    }
}

const FIND_BY_UUID_AND_LOOKUP: &str = r#"
    SELECT t.user_id, t.lookup, t.token_hash, t.expires_at
    FROM auth_tokens t
    INNER JOIN users u ON u.id = t.user_id
    WHERE u.uuid = ? AND t.lookup = ?
"#;

const ROTATE: &str = r#"
    UPDATE auth_tokens
    SET lookup = ?, token_hash = ?, expires_at = ?
    WHERE user_id = ? AND lookup = ?
"#;

#[async_trait]
impl AuthTokenRepository for SqlxAuthTokenRepository {
    async fn insert(&self, token: &AuthToken) -> Result<()> {
        let sql = "INSERT INTO auth_tokens (user_id, lookup, token_hash, expires_at) VALUES (?, ?, ?, ?)";
        match self.pool.backend()? {
            Backend::Sqlite(pool) => sqlx::query(sql)
                .bind(token.user_id)
                .bind(&token.lookup)
                .bind(&token.token_hash)
                .bind(token.expires_at)
                .execute(pool)
                .await
                .map(|_| ()),
            Backend::Mysql(pool) => sqlx::query(sql)
                .bind(token.user_id)
                .bind(&token.lookup)
                .bind(&token.token_hash)
                .bind(token.expires_at)
                .execute(pool)
                .await
                .map(|_| ()),
        }
        .context("Failed to create auth token")?;

        Ok(())
    }

    async fn find_by_user_uuid_and_lookup(&self, user_uuid: &str, lookup: &str) -> Result<Option<AuthToken>> {
        match self.pool.backend()? {
            Backend::Sqlite(pool) => find_token_sqlite(pool, user_uuid, lookup).await,
            Backend::Mysql(pool) => find_token_mysql(pool, user_uuid, lookup).await,
        }
    }

    async fn rotate(
        &self,
        user_id: i64,
        old_lookup: &str,
        new_lookup: &str,
        new_hash: &[u8],
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = match self.pool.backend()? {
            Backend::Sqlite(pool) => sqlx::query(ROTATE)
                .bind(new_lookup)
                .bind(new_hash)
                .bind(expires_at)
                .bind(user_id)
                .bind(old_lookup)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            Backend::Mysql(pool) => sqlx::query(ROTATE)
                .bind(new_lookup)
                .bind(new_hash)
                .bind(expires_at)
                .bind(user_id)
                .bind(old_lookup)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
        }
        .context("Failed to rotate auth token")?;

        Ok(affected == 1)
    }

    async fn delete_by_lookup(&self, user_id: i64, lookup: &str) -> Result<bool> {
        let sql = "DELETE FROM auth_tokens WHERE user_id = ? AND lookup = ?";
        let affected = match self.pool.backend()? {
            Backend::Sqlite(pool) => sqlx::query(sql)
                .bind(user_id)
                .bind(lookup)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            Backend::Mysql(pool) => sqlx::query(sql)
                .bind(user_id)
                .bind(lookup)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
        }
        .context("Failed to delete auth token")?;

        Ok(affected > 0)
    }

    async fn delete_by_user(&self, user_id: i64) -> Result<u64> {
        let sql = "DELETE FROM auth_tokens WHERE user_id = ?";
        match self.pool.backend()? {
            Backend::Sqlite(pool) => sqlx::query(sql)
                .bind(user_id)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            Backend::Mysql(pool) => sqlx::query(sql)
                .bind(user_id)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
        }
        .context("Failed to delete auth tokens by user")
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let sql = "DELETE FROM auth_tokens WHERE expires_at <= ?";
        match self.pool.backend()? {
            Backend::Sqlite(pool) => sqlx::query(sql)
                .bind(now)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            Backend::Mysql(pool) => sqlx::query(sql)
                .bind(now)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
        }
        .context("Failed to delete expired auth tokens")
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn find_token_sqlite(pool: &SqlitePool, user_uuid: &str, lookup: &str) -> Result<Option<AuthToken>> {
    let row = sqlx::query(FIND_BY_UUID_AND_LOOKUP)
        .bind(user_uuid)
        .bind(lookup)
        .fetch_optional(pool)
        .await
        .context("Failed to get auth token")?;

    row.map(|row| row_to_token_sqlite(&row)).transpose()
}

fn row_to_token_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<AuthToken> {
    Ok(AuthToken {
        user_id: row.try_get("user_id")?,
        lookup: row.try_get("lookup")?,
        token_hash: row.try_get("token_hash")?,
        expires_at: row.try_get("expires_at")?,
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn find_token_mysql(pool: &MySqlPool, user_uuid: &str, lookup: &str) -> Result<Option<AuthToken>> {
    let row = sqlx::query(FIND_BY_UUID_AND_LOOKUP)
        .bind(user_uuid)
        .bind(lookup)
        .fetch_optional(pool)
        .await
        .context("Failed to get auth token")?;

    row.map(|row| row_to_token_mysql(&row)).transpose()
}

fn row_to_token_mysql(row: &sqlx::mysql::MySqlRow) -> Result<AuthToken> {
    Ok(AuthToken {
        user_id: row.try_get("user_id")?,
        lookup: row.try_get("lookup")?,
        token_hash: row.try_get("token_hash")?,
        expires_at: row.try_get("expires_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{create_test_user, setup_test_pool, user_uuid};
    use chrono::Duration;

    async fn setup_test_repo() -> (DynDatabasePool, SqlxAuthTokenRepository) {
        let pool = setup_test_pool().await;
        let repo = SqlxAuthTokenRepository::new(pool.clone());
        (pool, repo)
    }

    fn token(user_id: i64, lookup: &str, expires_in_days: i64) -> AuthToken {
        AuthToken {
            user_id,
            lookup: lookup.to_string(),
            token_hash: vec![9; 32],
            expires_at: Utc::now() + Duration::days(expires_in_days),
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_by_uuid() {
        let (pool, repo) = setup_test_repo().await;
        let user_id = create_test_user(&pool, "alice").await;
        let uuid = user_uuid(&pool, user_id).await;

        repo.insert(&token(user_id, "lookup-a", 30)).await.unwrap();

        let found = repo
            .find_by_user_uuid_and_lookup(&uuid, "lookup-a")
            .await
            .unwrap()
            .expect("token should exist");
        assert_eq!(found.user_id, user_id);
        assert_eq!(found.token_hash, vec![9; 32]);

        assert!(repo
            .find_by_user_uuid_and_lookup("other-uuid", "lookup-a")
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .find_by_user_uuid_and_lookup(&uuid, "lookup-b")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_lookup_scoped_to_user() {
        let (pool, repo) = setup_test_repo().await;
        let alice = create_test_user(&pool, "alice").await;
        let bob = create_test_user(&pool, "bob").await;
        let bob_uuid = user_uuid(&pool, bob).await;

        repo.insert(&token(alice, "shared", 30)).await.unwrap();

        assert!(repo
            .find_by_user_uuid_and_lookup(&bob_uuid, "shared")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_pair_rejected() {
        let (pool, repo) = setup_test_repo().await;
        let user_id = create_test_user(&pool, "alice").await;

        repo.insert(&token(user_id, "dup", 30)).await.unwrap();
        assert!(repo.insert(&token(user_id, "dup", 30)).await.is_err());
    }

    #[tokio::test]
    async fn test_rotate_matches_once() {
        let (pool, repo) = setup_test_repo().await;
        let user_id = create_test_user(&pool, "alice").await;
        let uuid = user_uuid(&pool, user_id).await;
        repo.insert(&token(user_id, "old", 30)).await.unwrap();

        let expires_at = Utc::now() + Duration::days(30);
        assert!(repo.rotate(user_id, "old", "new", &[1; 32], expires_at).await.unwrap());
        assert!(!repo.rotate(user_id, "old", "newer", &[2; 32], expires_at).await.unwrap());

        assert!(repo.find_by_user_uuid_and_lookup(&uuid, "old").await.unwrap().is_none());
        let rotated = repo.find_by_user_uuid_and_lookup(&uuid, "new").await.unwrap().unwrap();
        assert_eq!(rotated.token_hash, vec![1; 32]);
        assert_eq!(rotated.expires_at, expires_at);
    }

    #[tokio::test]
    async fn test_delete_tokens() {
        let (pool, repo) = setup_test_repo().await;
        let alice = create_test_user(&pool, "alice").await;
        let bob = create_test_user(&pool, "bob").await;
        let bob_uuid = user_uuid(&pool, bob).await;

        repo.insert(&token(alice, "a1", 30)).await.unwrap();
        repo.insert(&token(alice, "a2", 30)).await.unwrap();
        repo.insert(&token(bob, "b1", 30)).await.unwrap();

        assert!(repo.delete_by_lookup(alice, "a1").await.unwrap());
        assert!(!repo.delete_by_lookup(alice, "a1").await.unwrap());
        assert_eq!(repo.delete_by_user(alice).await.unwrap(), 1);
        assert!(repo.find_by_user_uuid_and_lookup(&bob_uuid, "b1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_expired_tokens() {
        let (pool, repo) = setup_test_repo().await;
        let user_id = create_test_user(&pool, "alice").await;
        let uuid = user_uuid(&pool, user_id).await;

        repo.insert(&token(user_id, "stale", -1)).await.unwrap();
        repo.insert(&token(user_id, "fresh", 30)).await.unwrap();

        assert_eq!(repo.delete_expired(Utc::now()).await.unwrap(), 1);
        assert!(repo.find_by_user_uuid_and_lookup(&uuid, "fresh").await.unwrap().is_some());
    }
}
