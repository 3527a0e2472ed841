//! User repository
//!
//! Database operations for users.
//!
//! This module provides:
//! - `UserRepository` trait defining the interface for user data access
//! - `SqlxUserRepository` implementing the trait for SQLite and MySQL

use crate::db::{Backend, DynDatabasePool};
use crate::models::{User, UserRole};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{MySqlPool, Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;

const USER_COLUMNS: &str = "id, uuid, username, email, password_hash, role, created_at";

/// User repository trait
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Create a new user
    async fn create(&self, user: &User) -> Result<User>;

    /// Get user by ID
    async fn get_by_id(&self, id: i64) -> Result<Option<User>>;

    /// Get user by public UUID
    async fn get_by_uuid(&self, uuid: &str) -> Result<Option<User>>;

    /// Get user by username
    async fn get_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Get user by email
    async fn get_by_email(&self, email: &str) -> Result<Option<User>>;
}

/// SQLx-based user repository implementation
///
/// Supports both SQLite and MySQL databases.
pub struct SqlxUserRepository {
    pool: DynDatabasePool,
}

impl SqlxUserRepository {
    /// Create a new SQLx user repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn UserRepository> {
        Arc::new(Self::new(pool))
    }

    async fn get_by(&self, column: LookupColumn, value: UserKey<'_>) -> Result<Option<User>> {
        match self.pool.backend()? {
            Backend::Sqlite(pool) => get_user_by_sqlite(pool, column, value).await,
            Backend::Mysql(pool) => get_user_by_mysql(pool, column, value).await,
        }
    }
}

#[async_trait]
impl UserRepository for SqlxUserRepository {
    async fn create(&self, user: &User) -> Result<User> {
        match self.pool.backend()? {
            Backend::Sqlite(pool) => create_user_sqlite(pool, user).await,
            Backend::Mysql(pool) => create_user_mysql(pool, user).await,
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        self.get_by(LookupColumn::Id, UserKey::Id(id)).await
    }

    async fn get_by_uuid(&self, uuid: &str) -> Result<Option<User>> {
        self.get_by(LookupColumn::Uuid, UserKey::Text(uuid)).await
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        self.get_by(LookupColumn::Username, UserKey::Text(username)).await
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        self.get_by(LookupColumn::Email, UserKey::Text(email)).await
    }
}

#[derive(Debug, Clone, Copy)]
enum LookupColumn {
    Id,
    Uuid,
    Username,
    Email,
}

impl LookupColumn {
    fn as_str(self) -> &'static str {
        match self {
            LookupColumn::Id => "id",
            LookupColumn::Uuid => "uuid",
            LookupColumn::Username => "username",
            LookupColumn::Email => "email",
        }
    }

    fn select_sql(self) -> String {
        format!("SELECT {} FROM users WHERE {} = ?", USER_COLUMNS, self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum UserKey<'a> {
    Id(i64),
    Text(&'a str),
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn create_user_sqlite(pool: &SqlitePool, user: &User) -> Result<User> {
    let result = sqlx::query(
        r#"
        INSERT INTO users (uuid, username, email, password_hash, role, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&user.uuid)
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role.to_string())
    .bind(user.created_at)
    .execute(pool)
    .await
    .context("Failed to create user")?;

    Ok(User {
        id: result.last_insert_rowid(),
        ..user.clone()
    })
}

async fn get_user_by_sqlite(pool: &SqlitePool, column: LookupColumn, value: UserKey<'_>) -> Result<Option<User>> {
    let sql = column.select_sql();
    let query = sqlx::query(&sql);
    let query = match value {
        UserKey::Id(id) => query.bind(id),
        UserKey::Text(text) => query.bind(text),
    };

    let row = query
        .fetch_optional(pool)
        .await
        .with_context(|| format!("Failed to get user by {}", column.as_str()))?;

    row.map(|row| row_to_user_sqlite(&row)).transpose()
}

fn row_to_user_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    let role_str: String = row.try_get("role")?;
    let role = UserRole::from_str(&role_str)
        .with_context(|| format!("Invalid role in database: {}", role_str))?;

    Ok(User {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role,
        created_at: row.try_get("created_at")?,
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn create_user_mysql(pool: &MySqlPool, user: &User) -> Result<User> {
    let result = sqlx::query(
        r#"
        INSERT INTO users (uuid, username, email, password_hash, role, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&user.uuid)
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role.to_string())
    .bind(user.created_at)
    .execute(pool)
    .await
    .context("Failed to create user")?;

    Ok(User {
        id: result.last_insert_id() as i64,
        ..user.clone()
    })
}

async fn get_user_by_mysql(pool: &MySqlPool, column: LookupColumn, value: UserKey<'_>) -> Result<Option<User>> {
    let sql = column.select_sql();
    let query = sqlx::query(&sql);
    let query = match value {
        UserKey::Id(id) => query.bind(id),
        UserKey::Text(text) => query.bind(text),
    };

    let row = query
        .fetch_optional(pool)
        .await
        .with_context(|| format!("Failed to get user by {}", column.as_str()))?;

    row.map(|row| row_to_user_mysql(&row)).transpose()
}

fn row_to_user_mysql(row: &sqlx::mysql::MySqlRow) -> Result<User> {
    let role_str: String = row.try_get("role")?;
    let role = UserRole::from_str(&role_str)
        .with_context(|| format!("Invalid role in database: {}", role_str))?;

    Ok(User {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        role,
        created_at: row.try_get("created_at")?,
    })
}
