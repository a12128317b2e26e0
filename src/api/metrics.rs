//! Prometheus metrics endpoint

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::metrics::{OPEN_SESSIONS, REALTIME_LISTENERS, REGISTRY};

/// Returns all registered metrics in Prometheus text format.
///
/// Point-in-time gauges are sampled on scrape.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    OPEN_SESSIONS.set(state.sessions.len().await as i64);
    REALTIME_LISTENERS.set(state.db.feed().listener_count() as i64);

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
