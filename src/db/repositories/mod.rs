//! Database repositories
//!
//! Repository pattern implementations for database access.
//! Each repository handles the queries for a specific entity.

pub mod auth_token;
pub mod session;
pub mod user;

pub use auth_token::{AuthTokenRepository, SqlxAuthTokenRepository};
pub use session::{SessionRepository, SqlxSessionRepository};
pub use user::{SqlxUserRepository, UserRepository};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::db::{create_test_pool, migrations, Backend, DynDatabasePool};
    use chrono::Utc;

    /// In-memory pool with all migrations applied
    pub async fn setup_test_pool() -> DynDatabasePool {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        migrations::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    /// Insert a user row directly and return its id
    pub async fn create_test_user(pool: &DynDatabasePool, username: &str) -> i64 {
        let Backend::Sqlite(sqlite_pool) = pool.backend().unwrap() else {
            panic!("test pool must be SQLite");
        };
        sqlx::query(
            r#"
            INSERT INTO users (uuid, username, email, password_hash, role, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(username)
        .bind(format!("{}@example.com", username))
        .bind("hash")
        .bind("author")
        .bind(Utc::now())
        .execute(sqlite_pool)
        .await
        .expect("Failed to create test user")
        .last_insert_rowid()
    }

    pub async fn user_uuid(pool: &DynDatabasePool, user_id: i64) -> String {
        let Backend::Sqlite(sqlite_pool) = pool.backend().unwrap() else {
            panic!("test pool must be SQLite");
        };
        sqlx::query_scalar("SELECT uuid FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(sqlite_pool)
            .await
            .expect("Failed to read user uuid")
    }
}
