//! Configuration management
//!
//! This module handles loading and parsing configuration for Tessera.
//! Configuration can be loaded from:
//! - config.yml file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Session and remember-me configuration
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS allowed origin (for cookie-based auth)
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a reverse proxy that overwrites those headers.
    #[serde(default)]
    pub trust_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origin: default_cors_origin(),
            trust_proxy: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cors_origin() -> String {
    "http://localhost:3000".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite or mysql)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Seconds to wait for a pooled connection before failing the call
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
            max_connections: default_max_connections(),
            acquire_timeout_seconds: default_acquire_timeout(),
        }
    }
}

fn default_database_url() -> String {
    "data/tessera.db".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_acquire_timeout() -> u64 {
    5
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// MySQL
    Mysql,
}

/// Cache configuration for the session and user caches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached sessions
    #[serde(default = "default_session_capacity")]
    pub session_capacity: u64,
    /// Upper bound on how long a session stays cached
    #[serde(default = "default_session_cache_ttl")]
    pub session_ttl_seconds: u64,
    /// Maximum number of cached users
    #[serde(default = "default_user_capacity")]
    pub user_capacity: u64,
    /// How long a user entity stays cached
    #[serde(default = "default_user_cache_ttl")]
    pub user_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            session_capacity: default_session_capacity(),
            session_ttl_seconds: default_session_cache_ttl(),
            user_capacity: default_user_capacity(),
            user_ttl_seconds: default_user_cache_ttl(),
        }
    }
}

fn default_session_capacity() -> u64 {
    10_000
}

fn default_session_cache_ttl() -> u64 {
    600
}

fn default_user_capacity() -> u64 {
    1_000
}

fn default_user_cache_ttl() -> u64 {
    300
}

/// Session and remember-me configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Lifetime of a freshly issued session
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: i64,
    /// Sessions with less remaining lifetime than this are extended on use
    #[serde(default = "default_touch_threshold")]
    pub touch_threshold_seconds: i64,
    /// Interval between expired-session sweeps; 0 disables the sweeper
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Lifetime of a remember-me token
    #[serde(default = "default_auth_token_ttl_days")]
    pub auth_token_ttl_days: i64,
    /// Name of the session cookie
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    /// Name of the remember-me cookie
    #[serde(default = "default_auth_cookie")]
    pub auth_cookie: String,
    /// Add the `Secure` attribute to auth cookies
    #[serde(default)]
    pub secure_cookies: bool,
    /// Key used to sign the session cookie. A random key is generated at
    /// startup when unset, which invalidates all cookies on restart.
    #[serde(default)]
    pub cookie_secret: Option<String>,
    /// Failed remember-me attempts allowed per IP inside the window
    #[serde(default = "default_brute_force_attempts")]
    pub brute_force_max_attempts: u32,
    /// Window for the per-IP remember-me limiter
    #[serde(default = "default_brute_force_window")]
    pub brute_force_window_seconds: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: default_session_ttl(),
            touch_threshold_seconds: default_touch_threshold(),
            sweep_interval_seconds: default_sweep_interval(),
            auth_token_ttl_days: default_auth_token_ttl_days(),
            session_cookie: default_session_cookie(),
            auth_cookie: default_auth_cookie(),
            secure_cookies: false,
            cookie_secret: None,
            brute_force_max_attempts: default_brute_force_attempts(),
            brute_force_window_seconds: default_brute_force_window(),
        }
    }
}

fn default_session_ttl() -> i64 {
    2 * 60 * 60
}

fn default_touch_threshold() -> i64 {
    30 * 60
}

fn default_sweep_interval() -> u64 {
    15 * 60
}

fn default_auth_token_ttl_days() -> i64 {
    30
}

fn default_session_cookie() -> String {
    "sess".to_string()
}

fn default_auth_cookie() -> String {
    "auth".to_string()
}

fn default_brute_force_attempts() -> u32 {
    100
}

fn default_brute_force_window() -> i64 {
    24 * 60 * 60
}

/// Minimum accepted length of a configured cookie secret
pub const MIN_COOKIE_SECRET_LEN: usize = 32;

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.session_ttl_seconds)
    }

    pub fn touch_threshold(&self) -> Duration {
        Duration::seconds(self.touch_threshold_seconds)
    }

    pub fn auth_token_ttl(&self) -> Duration {
        Duration::days(self.auth_token_ttl_days)
    }

    pub fn brute_force_window(&self) -> Duration {
        Duration::seconds(self.brute_force_window_seconds)
    }

    /// Sweep interval, or `None` when sweeping is disabled
    pub fn sweep_interval(&self) -> Option<std::time::Duration> {
        match self.sweep_interval_seconds {
            0 => None,
            secs => Some(std::time::Duration::from_secs(secs)),
        }
    }
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError {
        path: String,
        message: String,
    },
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            }
        })?;

        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - TESSERA_SERVER_HOST
    /// - TESSERA_SERVER_PORT
    /// - TESSERA_SERVER_CORS_ORIGIN
    /// - TESSERA_DATABASE_DRIVER
    /// - TESSERA_DATABASE_URL
    /// - TESSERA_AUTH_SESSION_TTL_SECONDS
    /// - TESSERA_AUTH_SWEEP_INTERVAL_SECONDS
    /// - TESSERA_AUTH_SECURE_COOKIES
    /// - TESSERA_AUTH_COOKIE_SECRET
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("TESSERA_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("TESSERA_SERVER_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }
        if let Ok(cors_origin) = std::env::var("TESSERA_SERVER_CORS_ORIGIN") {
            self.server.cors_origin = cors_origin;
        }
        if let Ok(trust_proxy) = std::env::var("TESSERA_SERVER_TRUST_PROXY") {
            match trust_proxy.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.server.trust_proxy = true,
                "0" | "false" | "no" => self.server.trust_proxy = false,
                _ => {}
            }
        }

        if let Ok(driver) = std::env::var("TESSERA_DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "mysql" => self.database.driver = DatabaseDriver::Mysql,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(url) = std::env::var("TESSERA_DATABASE_URL") {
            self.database.url = url;
        }

        if let Ok(ttl) = std::env::var("TESSERA_AUTH_SESSION_TTL_SECONDS") {
            if let Ok(ttl) = ttl.parse::<i64>() {
                self.auth.session_ttl_seconds = ttl;
            }
        }
        if let Ok(interval) = std::env::var("TESSERA_AUTH_SWEEP_INTERVAL_SECONDS") {
            if let Ok(interval) = interval.parse::<u64>() {
                self.auth.sweep_interval_seconds = interval;
            }
        }
        if let Ok(secure) = std::env::var("TESSERA_AUTH_SECURE_COOKIES") {
            match secure.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.auth.secure_cookies = true,
                "0" | "false" | "no" => self.auth.secure_cookies = false,
                _ => {}
            }
        }
        if let Ok(secret) = std::env::var("TESSERA_AUTH_COOKIE_SECRET") {
            self.auth.cookie_secret = Some(secret);
        }
    }

    /// Reject combinations that would make sessions unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let auth = &self.auth;
        if auth.session_ttl_seconds <= 0 {
            return Err(ConfigError::ValidationError(
                "auth.session_ttl_seconds must be positive".to_string(),
            ));
        }
        if auth.touch_threshold_seconds < 0 || auth.touch_threshold_seconds >= auth.session_ttl_seconds {
            return Err(ConfigError::ValidationError(format!(
                "auth.touch_threshold_seconds must be in [0, {})",
                auth.session_ttl_seconds
            )));
        }
        if auth.auth_token_ttl_days <= 0 {
            return Err(ConfigError::ValidationError(
                "auth.auth_token_ttl_days must be positive".to_string(),
            ));
        }
        if auth.session_cookie.is_empty() || auth.auth_cookie.is_empty() || auth.session_cookie == auth.auth_cookie {
            return Err(ConfigError::ValidationError(
                "auth cookie names must be non-empty and distinct".to_string(),
            ));
        }
        if let Some(secret) = &auth.cookie_secret {
            if secret.len() < MIN_COOKIE_SECRET_LEN {
                return Err(ConfigError::ValidationError(format!(
                    "auth.cookie_secret must be at least {} bytes",
                    MIN_COOKIE_SECRET_LEN
                )));
            }
        }
        if self.cache.session_capacity == 0 || self.cache.user_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "cache capacities must be non-zero".to_string(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ENV_KEYS: &[&str] = &[
        "TESSERA_SERVER_HOST",
        "TESSERA_SERVER_PORT",
        "TESSERA_SERVER_CORS_ORIGIN",
        "TESSERA_SERVER_TRUST_PROXY",
        "TESSERA_DATABASE_DRIVER",
        "TESSERA_DATABASE_URL",
        "TESSERA_AUTH_SESSION_TTL_SECONDS",
        "TESSERA_AUTH_SWEEP_INTERVAL_SECONDS",
        "TESSERA_AUTH_SECURE_COOKIES",
        "TESSERA_AUTH_COOKIE_SECRET",
    ];

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        super::CONFIG_ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let path = std::path::Path::new("nonexistent_config.yml");
        let config = Config::load(path).unwrap();

        assert_eq!(config.server.port, 8080);
        assert!(!config.server.trust_proxy);
        assert_eq!(config.database.driver, DatabaseDriver::Sqlite);
        assert_eq!(config.database.url, "data/tessera.db");
        assert_eq!(config.auth.session_ttl_seconds, 7200);
        assert_eq!(config.auth.touch_threshold_seconds, 1800);
        assert_eq!(config.auth.auth_token_ttl_days, 30);
        assert_eq!(config.auth.session_cookie, "sess");
        assert_eq!(config.auth.auth_cookie, "auth");
        assert!(config.auth.cookie_secret.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_empty_file_returns_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "").unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.cache.session_capacity, 10_000);
    }

    #[test]
    fn test_load_partial_config_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "auth:\n  session_ttl_seconds: 3600\n  secure_cookies: true\n").unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.auth.session_ttl_seconds, 3600);
        assert!(config.auth.secure_cookies);
        assert_eq!(config.auth.touch_threshold_seconds, 1800);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_load_invalid_yaml_returns_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "server:\n  port: not_a_number\n").unwrap();

        let result = Config::load(file.path());

        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("parse") || err_msg.contains("invalid"));
    }

    #[test]
    fn test_sweep_interval_zero_disables() {
        let mut config = Config::default();
        assert_eq!(config.auth.sweep_interval(), Some(std::time::Duration::from_secs(900)));

        config.auth.sweep_interval_seconds = 0;
        assert_eq!(config.auth.sweep_interval(), None);
    }

    #[test]
    fn test_validate_rejects_threshold_not_below_ttl() {
        let mut config = Config::default();
        config.auth.touch_threshold_seconds = config.auth.session_ttl_seconds;

        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_rejects_short_cookie_secret() {
        let mut config = Config::default();
        config.auth.cookie_secret = Some("too-short".to_string());
        assert!(config.validate().is_err());

        config.auth.cookie_secret = Some("x".repeat(MIN_COOKIE_SECRET_LEN));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_same_cookie_names() {
        let mut config = Config::default();
        config.auth.auth_cookie = config.auth.session_cookie.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override_auth_config() {
        let _guard = lock_env();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "").unwrap();

        std::env::set_var("TESSERA_AUTH_SESSION_TTL_SECONDS", "5400");
        std::env::set_var("TESSERA_AUTH_SECURE_COOKIES", "true");
        std::env::set_var("TESSERA_AUTH_COOKIE_SECRET", "k".repeat(40));

        let config = Config::load_with_env(file.path()).unwrap();

        assert_eq!(config.auth.session_ttl_seconds, 5400);
        assert!(config.auth.secure_cookies);
        assert_eq!(config.auth.cookie_secret.as_deref(), Some("k".repeat(40).as_str()));

        clear_env();
    }

    #[test]
    fn test_trust_proxy_from_file_and_env() {
        let _guard = lock_env();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "server:\n  trust_proxy: true\n").unwrap();
        assert!(Config::load_with_env(file.path()).unwrap().server.trust_proxy);

        std::env::set_var("TESSERA_SERVER_TRUST_PROXY", "false");
        assert!(!Config::load_with_env(file.path()).unwrap().server.trust_proxy);

        clear_env();
    }

    #[test]
    fn test_env_override_invalid_values_ignored() {
        let _guard = lock_env();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "server:\n  port: 9000\n").unwrap();

        std::env::set_var("TESSERA_SERVER_PORT", "not-a-port");
        std::env::set_var("TESSERA_DATABASE_DRIVER", "postgres");

        let config = Config::load_with_env(file.path()).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.driver, DatabaseDriver::Sqlite);

        clear_env();
    }

    #[test]
    fn test_load_with_env_validates() {
        let _guard = lock_env();
        clear_env();

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "auth:\n  session_ttl_seconds: 600\n  touch_threshold_seconds: 900\n").unwrap();

        assert!(Config::load_with_env(file.path()).is_err());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(30))]

            /// Serializing a config to YAML and reading it back preserves the auth section.
            #[test]
            fn auth_config_roundtrip(
                ttl in 60i64..86_400,
                threshold_fraction in 0.0f64..0.99,
                days in 1i64..365,
                secure in any::<bool>(),
            ) {
                let mut config = Config::default();
                config.auth.session_ttl_seconds = ttl;
                config.auth.touch_threshold_seconds = (ttl as f64 * threshold_fraction) as i64;
                config.auth.auth_token_ttl_days = days;
                config.auth.secure_cookies = secure;

                let yaml = serde_yaml::to_string(&config).unwrap();
                let parsed: Config = serde_yaml::from_str(&yaml).unwrap();

                prop_assert_eq!(parsed.auth.session_ttl_seconds, ttl);
                prop_assert_eq!(parsed.auth.touch_threshold_seconds, config.auth.touch_threshold_seconds);
                prop_assert_eq!(parsed.auth.auth_token_ttl_days, days);
                prop_assert_eq!(parsed.auth.secure_cookies, secure);
                prop_assert!(parsed.validate().is_ok());
            }
        }
    }
}
