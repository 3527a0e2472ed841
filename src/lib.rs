//! Tessera - Session and remember-me authentication
//!
//! Server-side sessions with hashed secrets, rotating remember-me tokens,
//! and the axum middleware that ties them to requests.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod models;
pub mod services;
