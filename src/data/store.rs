//! Storage seams used by the unread core and the message pager
//!
//! [`Database`] implements both traits; tests substitute in-memory or
//! failing stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::database::Database;
use super::models::{ConversationKey, Message};
use crate::error::AppError;

/// Persistent read-cursor writes
#[async_trait]
pub trait ReadCursorStore: Send + Sync {
    /// Upsert the (user, conversation) cursor to `last_read`.
    async fn upsert_read_cursor(
        &self,
        user_id: &str,
        key: &ConversationKey,
        last_read: DateTime<Utc>,
    ) -> Result<(), AppError>;
}

/// Paged message history, newest first
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_page(
        &self,
        key: &ConversationKey,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, AppError>;
}

#[async_trait]
impl ReadCursorStore for Database {
    async fn upsert_read_cursor(
        &self,
        user_id: &str,
        key: &ConversationKey,
        last_read: DateTime<Utc>,
    ) -> Result<(), AppError> {
        Database::upsert_read_cursor(self, user_id, key, last_read).await
    }
}

#[async_trait]
impl MessageSource for Database {
    async fn fetch_page(
        &self,
        key: &ConversationKey,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        self.fetch_messages_page(key, before, limit).await
    }
}
