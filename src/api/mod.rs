//! API layer
//!
//! HTTP handlers for:
//! - Unread snapshot, read marks and the live event stream
//! - Conversation messages
//! - Clubs, direct conversations and profiles
//! - Metrics (Prometheus)

mod clubs;
mod messages;
pub mod metrics;
mod unread;

use axum::Router;

use crate::AppState;
use crate::data::ConversationKey;
use crate::error::AppError;

pub use clubs::clubs_router;
pub use messages::{MessageView, PageResponse, messages_router};
pub use metrics::metrics_router;
pub use unread::{MarkReadResponse, unread_router};

/// Every `/api/v1` route
pub fn api_router() -> Router<AppState> {
    Router::new()
        .merge(unread_router())
        .merge(messages_router())
        .merge(clubs_router())
}

/// Reject callers that are not members of the conversation
pub(crate) async fn require_participant(
    state: &AppState,
    user_id: &str,
    key: &ConversationKey,
) -> Result<(), AppError> {
    if state.db.is_participant(user_id, key).await? {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}
