//! Conversation message endpoints

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::require_participant;
use crate::AppState;
use crate::auth::CurrentUser;
use crate::chat::{MessagePager, format};
use crate::data::{ConversationKey, Message, MessageSource, NewMessage};
use crate::error::AppError;

/// Longest message accepted, in characters
const MAX_MESSAGE_CHARS: usize = 4_000;

/// Messages further apart than this start a new sender group
const GROUP_GAP_MINUTES: i64 = 5;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    /// Only messages strictly older than this
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub text: String,
}

/// A message with its display fields
#[derive(Debug, Serialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub display_name: String,
    pub time_label: String,
    /// First message of a run by the same sender
    pub starts_group: bool,
}

impl MessageView {
    fn new(message: Message, now: DateTime<Utc>, starts_group: bool) -> Self {
        Self {
            display_name: format::display_name(&message),
            time_label: format::time_label(message.timestamp, now),
            starts_group,
            message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PageResponse {
    /// Oldest first
    pub messages: Vec<MessageView>,
    pub has_more: bool,
    /// Pass as `before` to load the previous page
    pub next_before: Option<DateTime<Utc>>,
}

/// GET /api/v1/conversations/:kind/:id/messages
pub async fn list_messages(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path((kind, id)): Path<(String, String)>,
    Query(params): Query<PageParams>,
) -> Result<Json<PageResponse>, AppError> {
    let key = ConversationKey::new(kind.parse()?, id);
    require_participant(&state, &user_id, &key).await?;

    let source: Arc<dyn MessageSource> = state.db.clone();
    let mut pager = MessagePager::new(source, key, state.config.pagination.page_size);
    match params.before {
        Some(before) => pager.load_before(before).await?,
        None => pager.load_initial().await?,
    };

    let next_before = if pager.has_more() {
        pager.oldest_timestamp()
    } else {
        None
    };
    let now = Utc::now();
    let messages = format::group_by_sender(pager.messages(), Duration::minutes(GROUP_GAP_MINUTES))
        .into_iter()
        .flat_map(|group| {
            group
                .messages
                .into_iter()
                .enumerate()
                .map(move |(i, message)| MessageView::new(message, now, i == 0))
        })
        .collect();

    Ok(Json(PageResponse {
        messages,
        has_more: pager.has_more(),
        next_before,
    }))
}

/// POST /api/v1/conversations/:kind/:id/messages
pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path((kind, id)): Path<(String, String)>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageView>), AppError> {
    let key = ConversationKey::new(kind.parse()?, id);
    require_participant(&state, &user_id, &key).await?;

    if request.text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(AppError::Validation(format!(
            "message must be at most {MAX_MESSAGE_CHARS} characters"
        )));
    }

    let message = state
        .db
        .insert_message(
            &key,
            &NewMessage {
                sender_id: user_id.clone(),
                text: request.text,
            },
        )
        .await?;

    tracing::debug!(
        conversation = %key,
        message_id = %message.id,
        preview = %format::preview(&message.text, 40),
        "Message sent"
    );

    Ok((StatusCode::CREATED, Json(MessageView::new(message, Utc::now(), true))))
}

/// DELETE /api/v1/conversations/:kind/:id/messages/:message_id
///
/// Only the sender may delete a message.
pub async fn delete_message(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path((kind, id, message_id)): Path<(String, String, String)>,
) -> Result<StatusCode, AppError> {
    let key = ConversationKey::new(kind.parse()?, id);
    require_participant(&state, &user_id, &key).await?;

    let message = state
        .db
        .get_message(&key, &message_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if message.sender_id != user_id {
        return Err(AppError::Forbidden);
    }

    state
        .db
        .delete_message(&key, &message_id)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(StatusCode::NO_CONTENT)
}

pub fn messages_router() -> Router<AppState> {
    Router::new()
        .route(
            "/conversations/:kind/:id/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/conversations/:kind/:id/messages/:message_id",
            delete(delete_message),
        )
}
