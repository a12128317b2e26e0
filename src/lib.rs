//! Versus - unread tracking and chat delivery for club and direct chats
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    API Layer (Axum + SSE)                    │
//! │  - Unread snapshot, read marks, active signals, event stream │
//! │  - Messages, clubs, direct conversations                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Unread Core (per user)                      │
//! │  - Engine: unread sets, counts, typed events                 │
//! │  - Subscription manager: change feed -> unread marks         │
//! │  - Read-status mutator: optimistic, debounced cursor writes  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): messages, membership, read cursors         │
//! │  - Realtime change feed (tokio broadcast)                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `unread`: unread state engine, subscriptions, read-status mutator
//! - `chat`: message paging and formatting
//! - `data`: database and change feed
//! - `auth`: caller identity
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod unread;

use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool and change feed
    pub db: Arc<data::Database>,

    /// Per-user unread sessions
    pub sessions: Arc<unread::SessionRegistry>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrated
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let feed = data::ChangeFeed::new(config.realtime.channel_capacity);
        let db = Arc::new(data::Database::connect(&config.database.path, feed).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        let sessions = Arc::new(unread::SessionRegistry::new(db.clone(), config.clone()));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            sessions,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{cors::CorsLayer, trace::TraceLayer};

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .nest("/api/v1", api::api_router())
        .merge(api::metrics_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
