//! Realtime change feed
//!
//! Every committed write to a watched table is published as a
//! [`ChangeEvent`] carrying the new and/or old row. Listeners subscribe
//! with a [`TableFilter`] and only see events matching it.
//!
//! The feed is a bounded `tokio::sync::broadcast` channel. A listener that
//! falls behind receives [`FeedError::Lagged`]; callers treat that as a
//! dropped transport and resubscribe.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::models::{ConversationKey, ConversationKind, Message};

/// Tables that publish change events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedTable {
    ClubChatMessages,
    DirectMessages,
    /// `club_members` and `direct_conversations` participants
    Membership,
}

impl FeedTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedTable::ClubChatMessages => "club_chat_messages",
            FeedTable::DirectMessages => "direct_messages",
            FeedTable::Membership => "membership",
        }
    }

    pub fn for_messages(kind: ConversationKind) -> Self {
        match kind {
            ConversationKind::Club => FeedTable::ClubChatMessages,
            ConversationKind::Dm => FeedTable::DirectMessages,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// A user joining or leaving a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipRecord {
    pub user_id: String,
    pub conversation: ConversationKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FeedRecord {
    Message(Message),
    Membership(MembershipRecord),
}

impl FeedRecord {
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            FeedRecord::Message(message) => Some(message),
            FeedRecord::Membership(_) => None,
        }
    }
}

/// `{event, new, old}` payload of one committed change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub table: FeedTable,
    pub event: ChangeKind,
    pub new: Option<FeedRecord>,
    pub old: Option<FeedRecord>,
}

impl ChangeEvent {
    pub fn message_inserted(message: Message) -> Self {
        Self {
            table: FeedTable::for_messages(message.kind),
            event: ChangeKind::Insert,
            new: Some(FeedRecord::Message(message)),
            old: None,
        }
    }

    pub fn message_deleted(message: Message) -> Self {
        Self {
            table: FeedTable::for_messages(message.kind),
            event: ChangeKind::Delete,
            new: None,
            old: Some(FeedRecord::Message(message)),
        }
    }

    pub fn membership(event: ChangeKind, user_id: &str, conversation: ConversationKey) -> Self {
        let record = FeedRecord::Membership(MembershipRecord {
            user_id: user_id.to_string(),
            conversation,
        });
        let (new, old) = match event {
            ChangeKind::Delete => (None, Some(record)),
            ChangeKind::Insert | ChangeKind::Update => (Some(record), None),
        };

        Self {
            table: FeedTable::Membership,
            event,
            new,
            old,
        }
    }

    /// The row the event is about: `new` when present, otherwise `old`.
    pub fn record(&self) -> Option<&FeedRecord> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// Which events a listener receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableFilter {
    /// Message events of one table restricted to the given conversation ids
    Conversations {
        table: FeedTable,
        ids: HashSet<String>,
    },
    /// Membership events concerning one user
    MembershipOf { user_id: String },
}

impl TableFilter {
    pub fn conversations(kind: ConversationKind, ids: HashSet<String>) -> Self {
        TableFilter::Conversations {
            table: FeedTable::for_messages(kind),
            ids,
        }
    }

    pub fn table(&self) -> FeedTable {
        match self {
            TableFilter::Conversations { table, .. } => *table,
            TableFilter::MembershipOf { .. } => FeedTable::Membership,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table() {
            return false;
        }

        match (self, event.record()) {
            (TableFilter::Conversations { ids, .. }, Some(FeedRecord::Message(message))) => {
                ids.contains(&message.conversation_id)
            }
            (TableFilter::MembershipOf { user_id }, Some(FeedRecord::Membership(record))) => {
                &record.user_id == user_id
            }
            _ => false,
        }
    }
}

/// Error surfaced to a listener when the transport is no longer usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("listener lagged behind and missed {0} events")]
    Lagged(u64),
    #[error("change feed closed")]
    Closed,
}

/// Publish side of the change feed
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<Arc<ChangeEvent>>,
}

impl ChangeFeed {
    /// Create a feed buffering up to `capacity` events per listener.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish a committed change. Returns the number of listeners reached.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        tracing::trace!(
            table = event.table.as_str(),
            event = event.event.as_str(),
            "Publishing change event"
        );
        // No listeners is fine: nobody is watching this table right now.
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn subscribe(&self, filter: TableFilter) -> FeedSubscription {
        FeedSubscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One filtered listener on the feed
#[derive(Debug)]
pub struct FeedSubscription {
    receiver: broadcast::Receiver<Arc<ChangeEvent>>,
    filter: TableFilter,
}

impl FeedSubscription {
    pub fn filter(&self) -> &TableFilter {
        &self.filter
    }

    /// Wait for the next event matching the filter.
    pub async fn next(&mut self) -> Result<Arc<ChangeEvent>, FeedError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(FeedError::Lagged(missed));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn club_message(club_id: &str) -> Message {
        Message {
            id: "m1".to_string(),
            kind: ConversationKind::Club,
            text: "hi".to_string(),
            sender_id: "bob".to_string(),
            receiver_id: None,
            conversation_id: club_id.to_string(),
            timestamp: Utc::now(),
            sender: None,
        }
    }

    #[test]
    fn conversation_filter_matches_table_and_id() {
        let filter = TableFilter::conversations(
            ConversationKind::Club,
            HashSet::from(["club-1".to_string()]),
        );

        assert!(filter.matches(&ChangeEvent::message_inserted(club_message("club-1"))));
        assert!(filter.matches(&ChangeEvent::message_deleted(club_message("club-1"))));
        assert!(!filter.matches(&ChangeEvent::message_inserted(club_message("club-2"))));

        let dm_filter = TableFilter::conversations(
            ConversationKind::Dm,
            HashSet::from(["club-1".to_string()]),
        );
        assert!(!dm_filter.matches(&ChangeEvent::message_inserted(club_message("club-1"))));
    }

    #[test]
    fn membership_filter_matches_user() {
        let filter = TableFilter::MembershipOf {
            user_id: "alice".to_string(),
        };
        let joined = ChangeEvent::membership(ChangeKind::Insert, "alice", ConversationKey::club("c"));
        let other = ChangeEvent::membership(ChangeKind::Insert, "bob", ConversationKey::club("c"));

        assert!(filter.matches(&joined));
        assert!(!filter.matches(&other));
    }

    #[tokio::test]
    async fn subscription_skips_unmatched_events() {
        let feed = ChangeFeed::new(16);
        let mut subscription = feed.subscribe(TableFilter::conversations(
            ConversationKind::Club,
            HashSet::from(["club-2".to_string()]),
        ));

        feed.publish(ChangeEvent::message_inserted(club_message("club-1")));
        feed.publish(ChangeEvent::message_inserted(club_message("club-2")));

        let event = subscription.next().await.unwrap();
        let message = event.record().and_then(FeedRecord::as_message).unwrap();
        assert_eq!(message.conversation_id, "club-2");
    }

    #[tokio::test]
    async fn slow_listener_reports_lag() {
        let feed = ChangeFeed::new(2);
        let mut subscription = feed.subscribe(TableFilter::conversations(
            ConversationKind::Club,
            HashSet::from(["club-1".to_string()]),
        ));

        for _ in 0..5 {
            feed.publish(ChangeEvent::message_inserted(club_message("club-1")));
        }

        assert!(matches!(
            subscription.next().await,
            Err(FeedError::Lagged(_))
        ));
    }

    #[test]
    fn publish_without_listeners_is_not_an_error() {
        let feed = ChangeFeed::new(4);
        assert_eq!(
            feed.publish(ChangeEvent::message_inserted(club_message("club-1"))),
            0
        );
    }
}
