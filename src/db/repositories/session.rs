//! Session repository
//!
//! Database operations for session rows.
//!
//! This module provides:
//! - `SessionRepository` trait defining the interface for session data access
//! - `SqlxSessionRepository` implementing the trait for SQLite and MySQL
//!
//! Deletes hand back the rows they removed so the caller can run the expiry
//! hook with the session's last payload. SQLite does this with
//! `DELETE ... RETURNING`; MySQL locks the rows with `SELECT ... FOR UPDATE`
//! and deletes them inside the same transaction.

use crate::db::{Backend, DynDatabasePool};
use crate::models::{Session, SessionUpdate};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row, Sqlite, SqlitePool};
use std::sync::Arc;

const SESSION_COLUMNS: &str = "id, user_id, secret_hash, expires_at, data, created_at";

/// Session repository trait
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a new session row
    async fn insert(&self, session: &Session) -> Result<()>;

    /// Get session by ID
    async fn find_by_id(&self, id: &str) -> Result<Option<Session>>;

    /// Apply a partial update. Returns false if no row matched.
    async fn update_by_id(&self, id: &str, update: &SessionUpdate) -> Result<bool>;

    /// Delete a session, returning the row that was removed
    async fn delete_by_id(&self, id: &str) -> Result<Option<Session>>;

    /// Delete every session expired at `now`, returning the removed rows
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<Session>>;

    /// Delete all sessions for a user
    async fn delete_by_user(&self, user_id: i64) -> Result<u64>;
}

/// SQLx-based session repository implementation
///
/// Supports both SQLite and MySQL databases.
pub struct SqlxSessionRepository {
    pool: DynDatabasePool,
}

impl SqlxSessionRepository {
    /// Create a new SQLx session repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn SessionRepository> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl SessionRepository for SqlxSessionRepository {
    async fn insert(&self, session: &Session) -> Result<()> {
        match self.pool.backend()? {
            Backend::Sqlite(pool) => insert_session_sqlite(pool, session).await,
            Backend::Mysql(pool) => insert_session_mysql(pool, session).await,
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Session>> {
        match self.pool.backend()? {
            Backend::Sqlite(pool) => find_session_by_id_sqlite(pool, id).await,
            Backend::Mysql(pool) => find_session_by_id_mysql(pool, id).await,
        }
    }

    async fn update_by_id(&self, id: &str, update: &SessionUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(self.find_by_id(id).await?.is_some());
        }
        match self.pool.backend()? {
            Backend::Sqlite(pool) => update_session_sqlite(pool, id, update).await,
            Backend::Mysql(pool) => update_session_mysql(pool, id, update).await,
        }
    }

    async fn delete_by_id(&self, id: &str) -> Result<Option<Session>> {
        match self.pool.backend()? {
            Backend::Sqlite(pool) => delete_session_sqlite(pool, id).await,
            Backend::Mysql(pool) => delete_session_mysql(pool, id).await,
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<Session>> {
        match self.pool.backend()? {
            Backend::Sqlite(pool) => delete_expired_sessions_sqlite(pool, now).await,
            Backend::Mysql(pool) => delete_expired_sessions_mysql(pool, now).await,
        }
    }

    async fn delete_by_user(&self, user_id: i64) -> Result<u64> {
        let result = match self.pool.backend()? {
            Backend::Sqlite(pool) => sqlx::query("DELETE FROM sessions WHERE user_id = ?")
                .bind(user_id)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            Backend::Mysql(pool) => sqlx::query("DELETE FROM sessions WHERE user_id = ?")
                .bind(user_id)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
        };
        result.context("Failed to delete sessions by user")
    }
}

fn encode_data(data: &Option<Value>) -> Result<Option<String>> {
    data.as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to serialize session data")
}

fn decode_data(raw: Option<String>) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .context("Stored session data is not valid JSON")
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn insert_session_sqlite(pool: &SqlitePool, session: &Session) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (id, user_id, secret_hash, expires_at, data, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(session.user_id)
    .bind(&session.secret_hash)
    .bind(session.expires_at)
    .bind(encode_data(&session.data)?)
    .bind(session.created_at)
    .execute(pool)
    .await
    .context("Failed to create session")?;

    Ok(())
}

async fn find_session_by_id_sqlite(pool: &SqlitePool, id: &str) -> Result<Option<Session>> {
    let row = sqlx::query(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get session by ID")?;

    row.map(|row| row_to_session_sqlite(&row)).transpose()
}

async fn update_session_sqlite(pool: &SqlitePool, id: &str, update: &SessionUpdate) -> Result<bool> {
    let mut builder = QueryBuilder::<Sqlite>::new("UPDATE sessions SET ");
    let mut sets = builder.separated(", ");
    if let Some(expires_at) = update.expires_at {
        sets.push("expires_at = ").push_bind_unseparated(expires_at);
    }
    if let Some(data) = &update.data {
        sets.push("data = ").push_bind_unseparated(encode_data(data)?);
    }
    builder.push(" WHERE id = ").push_bind(id);

    let result = builder
        .build()
        .execute(pool)
        .await
        .context("Failed to update session")?;

    Ok(result.rows_affected() > 0)
}

async fn delete_session_sqlite(pool: &SqlitePool, id: &str) -> Result<Option<Session>> {
    let row = sqlx::query(&format!(
        "DELETE FROM sessions WHERE id = ? RETURNING {}",
        SESSION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("Failed to delete session")?;

    row.map(|row| row_to_session_sqlite(&row)).transpose()
}

async fn delete_expired_sessions_sqlite(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Session>> {
    let rows = sqlx::query(&format!(
        "DELETE FROM sessions WHERE expires_at <= ? RETURNING {}",
        SESSION_COLUMNS
    ))
    .bind(now)
    .fetch_all(pool)
    .await
    .context("Failed to delete expired sessions")?;

    rows.iter().map(row_to_session_sqlite).collect()
}

fn row_to_session_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        secret_hash: row.try_get("secret_hash")?,
        expires_at: row.try_get("expires_at")?,
        data: decode_data(row.try_get("data")?)?,
        created_at: row.try_get("created_at")?,
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn insert_session_mysql(pool: &MySqlPool, session: &Session) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (id, user_id, secret_hash, expires_at, data, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(session.user_id)
    .bind(&session.secret_hash)
    .bind(session.expires_at)
    .bind(encode_data(&session.data)?)
    .bind(session.created_at)
    .execute(pool)
    .await
    .context("Failed to create session")?;

    Ok(())
}

async fn find_session_by_id_mysql(pool: &MySqlPool, id: &str) -> Result<Option<Session>> {
    let row = sqlx::query(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to get session by ID")?;

    row.map(|row| row_to_session_mysql(&row)).transpose()
}

async fn update_session_mysql(pool: &MySqlPool, id: &str, update: &SessionUpdate) -> Result<bool> {
    let mut builder = QueryBuilder::<MySql>::new("UPDATE sessions SET ");
    let mut sets = builder.separated(", ");
    if let Some(expires_at) = update.expires_at {
        sets.push("expires_at = ").push_bind_unseparated(expires_at);
    }
    if let Some(data) = &update.data {
        sets.push("data = ").push_bind_unseparated(encode_data(data)?);
    }
    builder.push(" WHERE id = ").push_bind(id);

    builder
        .build()
        .execute(pool)
        .await
        .context("Failed to update session")?;

    // MySQL reports changed rows, not matched rows
    let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to check updated session")?;

    Ok(exists.is_some())
}

async fn delete_session_mysql(pool: &MySqlPool, id: &str) -> Result<Option<Session>> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let row = sqlx::query(&format!(
        "SELECT {} FROM sessions WHERE id = ? FOR UPDATE",
        SESSION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .context("Failed to lock session")?;

    let Some(row) = row else {
        tx.rollback().await.context("Failed to roll back transaction")?;
        return Ok(None);
    };
    let session = row_to_session_mysql(&row)?;

    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete session")?;

    tx.commit().await.context("Failed to commit session delete")?;
    Ok(Some(session))
}

async fn delete_expired_sessions_mysql(pool: &MySqlPool, now: DateTime<Utc>) -> Result<Vec<Session>> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let rows = sqlx::query(&format!(
        "SELECT {} FROM sessions WHERE expires_at <= ? FOR UPDATE",
        SESSION_COLUMNS
    ))
    .bind(now)
    .fetch_all(&mut *tx)
    .await
    .context("Failed to lock expired sessions")?;

    let sessions = rows
        .iter()
        .map(row_to_session_mysql)
        .collect::<Result<Vec<_>>>()?;

    if !sessions.is_empty() {
        sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("Failed to delete expired sessions")?;
    }

    tx.commit().await.context("Failed to commit expired session delete")?;
    Ok(sessions)
}

fn row_to_session_mysql(row: &sqlx::mysql::MySqlRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        secret_hash: row.try_get("secret_hash")?,
        expires_at: row.try_get("expires_at")?,
        data: decode_data(row.try_get("data")?)?,
        created_at: row.try_get("created_at")?,
    })
}
