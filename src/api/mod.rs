//! API layer - HTTP handlers and routing
//!
//! Auth endpoints under `/api/v1/auth`, with session resolution and sliding
//! expiration applied to every request.

pub mod auth;
pub mod cookies;
pub mod middleware;

use anyhow::Context;
use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use middleware::{ApiError, AppState, AuthenticatedUser, CurrentSession};

/// Build the main API router
pub fn build_api_router() -> Router<AppState> {
    Router::new().nest("/auth", auth::router())
}

/// Build the complete router with middleware
pub fn build_router(state: AppState, cors_origin: &str) -> anyhow::Result<Router> {
    let origin = cors_origin
        .parse::<HeaderValue>()
        .with_context(|| format!("Invalid CORS origin: {}", cors_origin))?;

    // Credentials are allowed so the browser sends the auth cookies
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::COOKIE])
        .allow_credentials(true);

    // Layers run outside-in: session_auth before sliding_expiration
    Ok(Router::new()
        .nest("/api/v1", build_api_router())
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::sliding_expiration,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::session_auth,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}
