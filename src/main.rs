//! Tessera - Session and remember-me authentication server

use anyhow::Result;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tessera::{
    api::{self, AppState},
    cache::create_caches,
    config::Config,
    db::{
        self,
        repositories::{SqlxAuthTokenRepository, SqlxSessionRepository, SqlxUserRepository},
    },
    services::{
        AttemptLimiter, AuthTokenManager, CookieSigner, CreateUserInput, DynClock, ExpirySweeper,
        NoopExpiryHook, SessionManager, SlidingWindowLimiter, SystemClock, UserService,
        UserServiceError,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tessera=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tessera...");

    // Load configuration
    let config = Config::load_with_env(Path::new("config.yml"))?;
    tracing::info!("Configuration loaded");

    // Initialize database
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("Database connected: {:?}", config.database.driver);

    db::migrations::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    let (session_cache, user_cache) = create_caches(&config.cache);
    tracing::info!("Caches initialized");

    let clock: DynClock = Arc::new(SystemClock);

    // Services
    let sessions = Arc::new(SessionManager::new(
        SqlxSessionRepository::boxed(pool.clone()),
        session_cache,
        Arc::new(NoopExpiryHook),
        clock.clone(),
        config.auth.session_ttl(),
    ));
    let brute_force: Arc<dyn AttemptLimiter> = Arc::new(SlidingWindowLimiter::with_clock(
        config.auth.brute_force_max_attempts,
        config.auth.brute_force_window(),
        clock.clone(),
    ));
    let login_limiter: Arc<dyn AttemptLimiter> = Arc::new(SlidingWindowLimiter::login());
    let auth_tokens = Arc::new(AuthTokenManager::new(
        SqlxAuthTokenRepository::boxed(pool.clone()),
        sessions.clone(),
        brute_force.clone(),
        clock,
        config.auth.auth_token_ttl(),
    ));
    let users = Arc::new(UserService::new(SqlxUserRepository::boxed(pool.clone()), user_cache));

    bootstrap_admin(&users).await?;

    let signer = match config.auth.cookie_secret.as_deref() {
        Some(secret) => CookieSigner::new(secret.as_bytes())?,
        None => {
            tracing::warn!("No cookie_secret configured, using a random key; sessions will not survive a restart");
            CookieSigner::random()?
        }
    };

    // Expired sessions, tokens and limiter buckets
    let sweeper = ExpirySweeper::new(
        sessions.clone(),
        auth_tokens.clone(),
        vec![brute_force, login_limiter.clone()],
    );
    sweeper.set_session_clear_interval(config.auth.sweep_interval());

    let state = AppState {
        sessions,
        auth_tokens,
        users,
        signer: Arc::new(signer),
        login_limiter,
        auth: Arc::new(config.auth.clone()),
        trust_proxy: config.server.trust_proxy,
    };

    let app = api::build_router(state, &config.server.cors_origin)?;

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Create the first administrator from `TESSERA_ADMIN_USERNAME`,
/// `TESSERA_ADMIN_EMAIL` and `TESSERA_ADMIN_PASSWORD` when all three are set
async fn bootstrap_admin(users: &UserService) -> Result<()> {
    let (Ok(username), Ok(email), Ok(password)) = (
        std::env::var("TESSERA_ADMIN_USERNAME"),
        std::env::var("TESSERA_ADMIN_EMAIL"),
        std::env::var("TESSERA_ADMIN_PASSWORD"),
    ) else {
        return Ok(());
    };

    let input = CreateUserInput::new(username, email, password)
        .with_role(tessera::models::UserRole::Admin);
    match users.create_user(input).await {
        Ok(user) => tracing::info!(user_id = user.id, "Bootstrap administrator created"),
        Err(UserServiceError::UserExists(_)) => tracing::debug!("Bootstrap administrator already exists"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
