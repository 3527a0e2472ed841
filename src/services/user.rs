//! User service
//!
//! Account lookup for the request middleware and credential checks for
//! login. Users resolved by id are kept in the `UserCache`.

use crate::cache::UserCache;
use crate::db::repositories::UserRepository;
use crate::models::{User, UserRole};
use crate::services::password::{hash_password, verify_password};
use anyhow::Context;
use std::sync::Arc;

/// Error types for user service operations
#[derive(Debug, thiserror::Error)]
pub enum UserServiceError {
    /// Unknown account or wrong password. Deliberately not more specific.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Invalid input
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Username or email taken
    #[error("User already exists: {0}")]
    UserExists(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

pub struct UserService {
    repo: Arc<dyn UserRepository>,
    cache: Arc<UserCache>,
}

impl UserService {
    pub fn new(repo: Arc<dyn UserRepository>, cache: Arc<UserCache>) -> Self {
        Self { repo, cache }
    }

    /// Resolve a user id, through the cache
    pub async fn get_user(&self, id: i64) -> Result<Option<User>, UserServiceError> {
        if let Some(user) = self.cache.get(id).await {
            return Ok(Some(user));
        }

        let user = self
            .repo
            .get_by_id(id)
            .await
            .context("Failed to get user by id")?;

        if let Some(user) = &user {
            self.cache.set(user.clone()).await;
        }
        Ok(user)
    }

    /// Verify credentials.
    ///
    /// The identifier is tried as a username first, then as an email.
    pub async fn login(&self, input: LoginInput) -> Result<User, UserServiceError> {
        let Some(user) = self.find_by_username_or_email(&input.username_or_email).await? else {
            return Err(UserServiceError::InvalidCredentials);
        };

        let valid = verify_password(&input.password, &user.password_hash)
            .context("Failed to verify password")?;
        if !valid {
            return Err(UserServiceError::InvalidCredentials);
        }

        self.cache.set(user.clone()).await;
        Ok(user)
    }

    /// Create an account. Used for bootstrap and tests; there is no public
    /// registration route.
    pub async fn create_user(&self, input: CreateUserInput) -> Result<User, UserServiceError> {
        validate_create_input(&input)?;

        if self
            .repo
            .get_by_username(&input.username)
            .await
            .context("Failed to check username")?
            .is_some()
        {
            return Err(UserServiceError::UserExists(format!(
                "Username '{}' is already taken",
                input.username
            )));
        }

        if self
            .repo
            .get_by_email(&input.email)
            .await
            .context("Failed to check email")?
            .is_some()
        {
            return Err(UserServiceError::UserExists(format!(
                "Email '{}' is already registered",
                input.email
            )));
        }

        let password_hash = hash_password(&input.password).context("Failed to hash password")?;
        let user = User::new(input.username, input.email, password_hash, input.role);

        let created = self
            .repo
            .create(&user)
            .await
            .context("Failed to create user")?;

        tracing::info!(user_id = created.id, role = %created.role, "User created");
        Ok(created)
    }

    async fn find_by_username_or_email(
        &self,
        username_or_email: &str,
    ) -> Result<Option<User>, UserServiceError> {
        if let Some(user) = self
            .repo
            .get_by_username(username_or_email)
            .await
            .context("Failed to get user by username")?
        {
            return Ok(Some(user));
        }

        let user = self
            .repo
            .get_by_email(username_or_email)
            .await
            .context("Failed to get user by email")?;

        Ok(user)
    }
}

fn validate_create_input(input: &CreateUserInput) -> Result<(), UserServiceError> {
    if input.username.trim().is_empty() {
        return Err(UserServiceError::ValidationError(
            "Username cannot be empty".to_string(),
        ));
    }

    if !input.email.contains('@') {
        return Err(UserServiceError::ValidationError(
            "Invalid email format".to_string(),
        ));
    }

    if input.password.is_empty() {
        return Err(UserServiceError::ValidationError(
            "Password cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Input for account creation
#[derive(Debug, Clone)]
pub struct CreateUserInput {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: UserRole,
}

impl CreateUserInput {
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: password.into(),
            role: UserRole::default(),
        }
    }

    pub fn with_role(mut self, role: UserRole) -> Self {
        self.role = role;
        self
    }
}

/// Input for user login
#[derive(Debug, Clone)]
pub struct LoginInput {
    pub username_or_email: String,
    pub password: String,
}

impl LoginInput {
    pub fn new(username_or_email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username_or_email: username_or_email.into(),
            password: password.into(),
        }
    }
}
