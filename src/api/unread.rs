//! Unread endpoints
//!
//! Snapshot, read marks, active-conversation signals and the live event
//! stream for the caller's session.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post, put},
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use super::require_participant;
use crate::AppState;
use crate::auth::CurrentUser;
use crate::data::ConversationKey;
use crate::error::AppError;
use crate::unread::{MarkReadOutcome, UnreadEvent, UnreadSnapshot};

/// Longest debounce a client may request
const MAX_DELAY_MS: u64 = 10_000;

#[derive(Debug, Deserialize)]
pub struct MarkReadParams {
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub conversation: ConversationKey,
    pub outcome: MarkReadOutcome,
    pub snapshot: UnreadSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ActiveResponse {
    pub conversation: ConversationKey,
    pub active: bool,
    pub changed: bool,
}

/// GET /api/v1/unread
pub async fn get_unread(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<UnreadSnapshot>, AppError> {
    let session = state.sessions.get_or_open(&user_id).await?;
    Ok(Json(session.snapshot()))
}

/// POST /api/v1/unread/:kind/:id/read
///
/// Responds once the cursor write has settled. A failed write is not an
/// HTTP error: the outcome is `rolled_back` and a toast is emitted on the
/// stream.
pub async fn mark_read(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path((kind, id)): Path<(String, String)>,
    Query(params): Query<MarkReadParams>,
) -> Result<Json<MarkReadResponse>, AppError> {
    let key = ConversationKey::new(kind.parse()?, id);
    require_participant(&state, &user_id, &key).await?;

    let delay = params
        .delay_ms
        .map(|ms| Duration::from_millis(ms.min(MAX_DELAY_MS)));
    let session = state.sessions.get_or_open(&user_id).await?;
    let outcome = session
        .mark_conversation_read(key.kind, &key.id, delay)
        .await;

    tracing::debug!(user_id = %user_id, conversation = %key, ?outcome, "Read mark settled");

    Ok(Json(MarkReadResponse {
        conversation: key,
        outcome,
        snapshot: session.snapshot(),
    }))
}

/// PUT /api/v1/unread/:kind/:id/active
pub async fn set_active(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<ActiveResponse>, AppError> {
    let key = ConversationKey::new(kind.parse()?, id);
    require_participant(&state, &user_id, &key).await?;

    let session = state.sessions.get_or_open(&user_id).await?;
    let changed = session.set_active(key.kind, &key.id);

    Ok(Json(ActiveResponse {
        conversation: key,
        active: true,
        changed,
    }))
}

/// DELETE /api/v1/unread/:kind/:id/active
pub async fn clear_active(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Json<ActiveResponse>, AppError> {
    let key = ConversationKey::new(kind.parse()?, id);
    require_participant(&state, &user_id, &key).await?;

    let session = state.sessions.get_or_open(&user_id).await?;
    let changed = session.clear_active(key.kind, &key.id);

    Ok(Json(ActiveResponse {
        conversation: key,
        active: false,
        changed,
    }))
}

/// GET /api/v1/unread/stream
///
/// Starts with the current snapshot, then forwards every session event.
/// A client that falls behind receives a fresh snapshot in place of the
/// events it missed. The session closes when its last stream disconnects.
pub async fn stream_unread(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let lease = state.sessions.open_stream(&user_id).await?;
    let receiver = lease.session().subscribe();
    let initial = UnreadEvent::Changed {
        snapshot: lease.session().snapshot(),
    };

    // The lease lives as long as the stream
    let updates = BroadcastStream::new(receiver).map(move |item| match item {
        Ok(event) => event,
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            let session = lease.session();
            tracing::debug!(user_id = %session.user_id(), missed, "Stream client lagged");
            UnreadEvent::Changed {
                snapshot: session.snapshot(),
            }
        }
    });

    let stream = tokio_stream::once(initial)
        .chain(updates)
        .map(|event| Ok(to_sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn to_sse_event(event: &UnreadEvent) -> Event {
    Event::default()
        .event(event.name())
        .json_data(event)
        .unwrap_or_else(|error| {
            tracing::error!(%error, "Failed to encode stream event");
            Event::default().event("error")
        })
}

pub fn unread_router() -> Router<AppState> {
    Router::new()
        .route("/unread", get(get_unread))
        .route("/unread/stream", get(stream_unread))
        .route("/unread/:kind/:id/read", post(mark_read))
        .route("/unread/:kind/:id/active", put(set_active).delete(clear_active))
}
