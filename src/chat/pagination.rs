//! Message history paging
//!
//! Pages are fetched newest-first and reversed for display. Loading more
//! pages backward from the oldest loaded message uses a strict `<` so the
//! boundary message is never fetched twice. A short page means the
//! history is exhausted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::data::{ConversationKey, Message, MessageSource};
use crate::error::AppError;

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// One page of messages in display order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    /// Oldest first
    pub messages: Vec<Message>,
    pub has_more: bool,
}

impl Page {
    /// Build a page from a newest-first fetch of at most `page_size` rows
    pub fn from_newest_first(mut messages: Vec<Message>, page_size: usize) -> Self {
        let has_more = messages.len() >= page_size;
        messages.reverse();
        Self { messages, has_more }
    }

    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|message| message.timestamp)
    }
}

/// Loaded history of one conversation
pub struct MessagePager {
    source: Arc<dyn MessageSource>,
    key: ConversationKey,
    page_size: usize,
    messages: Vec<Message>,
    has_more: bool,
    loaded: bool,
}

impl MessagePager {
    pub fn new(source: Arc<dyn MessageSource>, key: ConversationKey, page_size: usize) -> Self {
        Self {
            source,
            key,
            page_size: page_size.max(1),
            messages: Vec::new(),
            has_more: true,
            loaded: false,
        }
    }

    async fn fetch(&self, before: Option<DateTime<Utc>>) -> Result<Page, AppError> {
        let rows = self
            .source
            .fetch_page(&self.key, before, self.page_size)
            .await?;
        Ok(Page::from_newest_first(rows, self.page_size))
    }

    fn replace(&mut self, page: Page) -> &[Message] {
        self.messages = page.messages;
        self.has_more = page.has_more;
        self.loaded = true;
        &self.messages
    }

    /// Replace the loaded history with the newest page
    pub async fn load_initial(&mut self) -> Result<&[Message], AppError> {
        let page = self.fetch(None).await?;
        tracing::debug!(
            conversation = %self.key,
            loaded = page.messages.len(),
            has_more = page.has_more,
            "Loaded latest messages"
        );
        Ok(self.replace(page))
    }

    /// Replace the loaded history with the page strictly older than `before`
    ///
    /// Resumes paging from a cursor the caller kept, e.g. a previous
    /// page's oldest timestamp.
    pub async fn load_before(&mut self, before: DateTime<Utc>) -> Result<&[Message], AppError> {
        let page = self.fetch(Some(before)).await?;
        Ok(self.replace(page))
    }

    /// Prepend the page before the oldest loaded message
    ///
    /// # Returns
    /// Number of messages added; 0 once the history is exhausted
    pub async fn load_more(&mut self) -> Result<usize, AppError> {
        if !self.loaded {
            return self.load_initial().await.map(<[Message]>::len);
        }
        if !self.has_more {
            return Ok(0);
        }
        let Some(oldest) = self.oldest_timestamp() else {
            self.has_more = false;
            return Ok(0);
        };

        let page = self.fetch(Some(oldest)).await?;
        let added = page.messages.len();
        self.has_more = page.has_more;
        self.messages.splice(0..0, page.messages);

        tracing::debug!(conversation = %self.key, added, has_more = self.has_more, "Loaded older messages");
        Ok(added)
    }

    /// Add a message delivered live. Returns `false` for duplicates and
    /// messages of other conversations.
    pub fn push_live(&mut self, message: Message) -> bool {
        if message.key() != self.key || self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }

        let position = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(position, message);
        true
    }

    /// Drop a deleted message
    pub fn remove(&mut self, message_id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != message_id);
        self.messages.len() != before
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|message| message.timestamp)
    }
}
