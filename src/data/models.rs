//! Data models
//!
//! Rust structs representing database entities and feed payloads.
//! Message IDs are ULIDs and all timestamps are chrono UTC values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage representation of message and cursor timestamps
pub(crate) fn to_micros(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// =============================================================================
// Conversations
// =============================================================================

/// Which chat a conversation id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    /// A club's group chat; the id is the club id
    Club,
    /// A direct-message thread between two users
    Dm,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Club => "club",
            ConversationKind::Dm => "dm",
        }
    }
}

impl fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "club" => Ok(ConversationKind::Club),
            "dm" => Ok(ConversationKind::Dm),
            other => Err(AppError::Validation(format!(
                "unknown conversation kind: {other}"
            ))),
        }
    }
}

/// Composite key identifying one conversation of one kind.
///
/// Club ids and DM conversation ids live in separate namespaces, so the
/// kind is part of the key rather than a string prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub kind: ConversationKind,
    pub id: String,
}

impl ConversationKey {
    pub fn new(kind: ConversationKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn club(id: impl Into<String>) -> Self {
        Self::new(ConversationKind::Club, id)
    }

    pub fn dm(id: impl Into<String>) -> Self {
        Self::new(ConversationKind::Dm, id)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Denormalized sender details attached when the profile is known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub display_name: String,
}

/// A chat message in a club chat or a direct conversation
///
/// Immutable once created. `conversation_id` is the club id for club
/// messages and the DM conversation id for direct messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: ConversationKind,
    pub text: String,
    pub sender_id: String,
    /// Only set for direct messages
    pub receiver_id: Option<String>,
    pub conversation_id: String,
    pub timestamp: DateTime<Utc>,
    pub sender: Option<Sender>,
}

impl Message {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.kind, self.conversation_id.clone())
    }
}

/// Row shape shared by both message tables
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct MessageRow {
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub conversation_id: String,
    /// Unix microseconds
    pub created_at: i64,
    pub sender_name: Option<String>,
}

impl MessageRow {
    pub(crate) fn into_message(self, kind: ConversationKind) -> Message {
        let sender = self.sender_name.map(|display_name| Sender {
            id: self.sender_id.clone(),
            display_name,
        });

        Message {
            id: self.id,
            kind,
            text: self.text,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            conversation_id: self.conversation_id,
            timestamp: from_micros(self.created_at),
            sender,
        }
    }
}

/// Input for a new chat message
#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub text: String,
}

// =============================================================================
// Read cursors
// =============================================================================

/// Last-read position of one user in one conversation
///
/// Upserted keyed by (user, conversation); never duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadCursor {
    pub conversation: ConversationKey,
    pub user_id: String,
    pub last_read_timestamp: DateTime<Utc>,
}

// =============================================================================
// Clubs & membership
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Club {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DirectConversation {
    pub id: String,
    pub user_a: String,
    pub user_b: String,
    pub created_at: DateTime<Utc>,
}

impl DirectConversation {
    /// The participant that is not `user_id`, if `user_id` participates.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if self.user_a == user_id {
            Some(&self.user_b)
        } else if self.user_b == user_id {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

/// A user's club and conversation ids, the basis of realtime filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Membership {
    pub club_ids: std::collections::HashSet<String>,
    pub conversation_ids: std::collections::HashSet<String>,
}

impl Membership {
    pub fn ids(&self, kind: ConversationKind) -> &std::collections::HashSet<String> {
        match kind {
            ConversationKind::Club => &self.club_ids,
            ConversationKind::Dm => &self.conversation_ids,
        }
    }

    pub fn ids_mut(&mut self, kind: ConversationKind) -> &mut std::collections::HashSet<String> {
        match kind {
            ConversationKind::Club => &mut self.club_ids,
            ConversationKind::Dm => &mut self.conversation_ids,
        }
    }

    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.ids(key.kind).contains(&key.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_kind_parses_known_values() {
        assert_eq!("club".parse::<ConversationKind>().unwrap(), ConversationKind::Club);
        assert_eq!("dm".parse::<ConversationKind>().unwrap(), ConversationKind::Dm);
        assert!("group".parse::<ConversationKind>().is_err());
    }

    #[test]
    fn keys_of_different_kinds_never_collide() {
        let club = ConversationKey::club("42");
        let dm = ConversationKey::dm("42");
        assert_ne!(club, dm);
        assert_eq!(club.to_string(), "club:42");
        assert_eq!(dm.to_string(), "dm:42");
    }

    #[test]
    fn other_participant_requires_membership() {
        let conversation = DirectConversation {
            id: "c1".to_string(),
            user_a: "alice".to_string(),
            user_b: "bob".to_string(),
            created_at: Utc::now(),
        };
        assert_eq!(conversation.other_participant("alice"), Some("bob"));
        assert_eq!(conversation.other_participant("bob"), Some("alice"));
        assert_eq!(conversation.other_participant("carol"), None);
    }
}
