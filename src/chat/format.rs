//! Message formatting helpers for chat views

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Serialize;

use crate::data::Message;

const ELLIPSIS: char = '…';

/// Name shown next to a message
///
/// Falls back to a short form of the sender id when the profile has no name.
pub fn display_name(message: &Message) -> String {
    if let Some(name) = message
        .sender
        .as_ref()
        .map(|sender| sender.display_name.trim())
        .filter(|name| !name.is_empty())
    {
        return name.to_string();
    }

    let short: String = message.sender_id.chars().take(8).collect();
    format!("User {short}")
}

/// Timestamp label relative to `now`
///
/// "14:05" for today, "Yesterday", the weekday inside the last week,
/// otherwise "Mar 04".
pub fn time_label(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let day = timestamp.date_naive();
    let today = now.date_naive();

    if day == today {
        timestamp.format("%H:%M").to_string()
    } else if today.pred_opt() == Some(day) {
        "Yesterday".to_string()
    } else if day < today && today.signed_duration_since(day) < Duration::days(7) {
        timestamp.weekday().to_string()
    } else {
        timestamp.format("%b %d").to_string()
    }
}

/// Consecutive messages from one sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageGroup {
    pub sender_id: String,
    pub messages: Vec<Message>,
}

/// Group consecutive messages by sender
///
/// A new group starts when the sender changes or when more than `gap`
/// passed since the previous message. Input is expected oldest first.
pub fn group_by_sender(messages: &[Message], gap: Duration) -> Vec<MessageGroup> {
    let mut groups: Vec<MessageGroup> = Vec::new();

    for message in messages {
        if let Some(group) = groups.last_mut() {
            let continues = group.sender_id == message.sender_id
                && group
                    .messages
                    .last()
                    .is_some_and(|last| message.timestamp - last.timestamp <= gap);
            if continues {
                group.messages.push(message.clone());
                continue;
            }
        }

        groups.push(MessageGroup {
            sender_id: message.sender_id.clone(),
            messages: vec![message.clone()],
        });
    }

    groups
}

/// Single-line preview of at most `max_chars` characters
pub fn preview(text: &str, max_chars: usize) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() <= max_chars {
        return line;
    }
    if max_chars == 0 {
        return String::new();
    }

    let mut truncated: String = line.chars().take(max_chars - 1).collect();
    truncated.truncate(truncated.trim_end().len());
    truncated.push(ELLIPSIS);
    truncated
}
