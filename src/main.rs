//! Versus binary entry point

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use versus::{AppState, config};

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics and AppState
/// 4. Start background tasks (unread refresh, idle session eviction)
/// 5. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    let default_filter = format!("versus={},tower_http=debug", config.logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Versus...");

    // 3. Initialize metrics and application state
    versus::metrics::init_metrics();

    tracing::info!(
        database = %config.database.path.display(),
        debounce_ms = config.read_status.debounce_ms,
        max_attempts = config.read_status.max_attempts,
        "Configuration loaded"
    );

    let state = AppState::new(config.clone()).await?;

    // 4. Start background tasks
    if config.realtime.refresh_interval_seconds > 0 {
        spawn_refresh_task(state.clone());
    }
    if let Some(idle) = config.realtime.session_idle() {
        spawn_session_sweeper(state.clone(), idle);
    }

    // 5. Start HTTP server
    let app = versus::build_router(state.clone());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.sessions.close_all().await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Spawn the periodic full unread refresh
///
/// Catches messages a listener missed while its transport was down.
fn spawn_refresh_task(state: AppState) {
    tokio::spawn(async move {
        let interval_secs = state.config.realtime.refresh_interval_seconds;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

        // Sessions are seeded when opened; skip the immediate first tick.
        interval.tick().await;

        loop {
            interval.tick().await;

            let refreshed = state.sessions.refresh_all().await;
            tracing::debug!(sessions = refreshed, "Unread refresh completed");
        }
    });

    tracing::info!("Unread refresh task spawned");
}

/// Spawn the task closing sessions nobody uses any more
fn spawn_session_sweeper(state: AppState, idle: std::time::Duration) {
    tokio::spawn(async move {
        let period = (idle / 2).max(std::time::Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            interval.tick().await;

            let evicted = state.sessions.evict_idle(idle).await;
            if evicted > 0 {
                tracing::info!(evicted, "Idle unread sessions closed");
            }
        }
    });

    tracing::info!(idle_secs = idle.as_secs(), "Session sweeper spawned");
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
