//! Unread State Engine
//!
//! Holds the per-session unread club and conversation sets with their
//! counts, and notifies observers on every net change. All mutation goes
//! through [`UnreadEngine::mark_unread`] and [`UnreadEngine::mark_read`];
//! both are idempotent and publish at most one [`UnreadEvent::Changed`]
//! per call, synchronously, before returning.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use super::notifier::Toast;
use crate::data::{ConversationKey, ConversationKind};
use crate::metrics::UNREAD_CONVERSATIONS;

/// Immutable view of the engine state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnreadSnapshot {
    pub unread_club_ids: BTreeSet<String>,
    pub unread_conversation_ids: BTreeSet<String>,
    pub club_count: usize,
    pub dm_count: usize,
    pub total_count: usize,
}

impl UnreadSnapshot {
    pub fn contains(&self, key: &ConversationKey) -> bool {
        match key.kind {
            ConversationKind::Club => self.unread_club_ids.contains(&key.id),
            ConversationKind::Dm => self.unread_conversation_ids.contains(&key.id),
        }
    }
}

/// Lifecycle of one optimistic read mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadState {
    /// Applied locally, cursor write scheduled or in flight
    PendingWrite,
    /// Cursor persisted
    Confirmed,
    /// Cursor write failed; the conversation is unread again
    RolledBack,
}

/// Typed notification delivered to UI listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UnreadEvent {
    /// The unread sets changed
    Changed { snapshot: UnreadSnapshot },
    /// A read mark moved through its lifecycle
    ReadStateUpdated {
        conversation: ConversationKey,
        state: ReadState,
    },
    /// The read cursor for a conversation was persisted
    MessagesMarkedRead {
        conversation_id: String,
        #[serde(rename = "type")]
        kind: ConversationKind,
    },
    /// A user-visible notification
    Toast { toast: Toast },
}

impl UnreadEvent {
    /// Event name used on the SSE stream
    pub fn name(&self) -> &'static str {
        match self {
            UnreadEvent::Changed { .. } => "changed",
            UnreadEvent::ReadStateUpdated { .. } => "read_state_updated",
            UnreadEvent::MessagesMarkedRead { .. } => "messages_marked_read",
            UnreadEvent::Toast { .. } => "toast",
        }
    }
}

/// Publish/subscribe channel for [`UnreadEvent`]s
///
/// Publishing never blocks; listeners that fall more than the channel
/// capacity behind skip ahead.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UnreadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: UnreadEvent) {
        // Having no listeners is normal (no UI attached).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UnreadEvent> {
        self.sender.subscribe()
    }
}

#[derive(Debug, Default)]
struct UnreadSet {
    ids: HashSet<String>,
    count: usize,
}

#[derive(Debug, Default)]
struct UnreadState {
    clubs: UnreadSet,
    dms: UnreadSet,
    /// Bumped on every net change
    revision: u64,
    /// Revision of the last change per conversation
    changed_at: HashMap<ConversationKey, u64>,
}

impl UnreadState {
    fn set_mut(&mut self, kind: ConversationKind) -> &mut UnreadSet {
        match kind {
            ConversationKind::Club => &mut self.clubs,
            ConversationKind::Dm => &mut self.dms,
        }
    }

    fn set(&self, kind: ConversationKind) -> &UnreadSet {
        match kind {
            ConversationKind::Club => &self.clubs,
            ConversationKind::Dm => &self.dms,
        }
    }

    fn snapshot(&self) -> UnreadSnapshot {
        UnreadSnapshot {
            unread_club_ids: self.clubs.ids.iter().cloned().collect(),
            unread_conversation_ids: self.dms.ids.iter().cloned().collect(),
            club_count: self.clubs.count,
            dm_count: self.dms.count,
            total_count: self.clubs.count + self.dms.count,
        }
    }
}

/// In-memory unread state for one user session
#[derive(Debug)]
pub struct UnreadEngine {
    state: Mutex<UnreadState>,
    bus: EventBus,
}

impl UnreadEngine {
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: Mutex::new(UnreadState::default()),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnreadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The bus this engine publishes on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UnreadEvent> {
        self.bus.subscribe()
    }

    fn apply_locked(&self, state: &mut UnreadState, key: &ConversationKey, unread: bool) -> bool {
        let set = state.set_mut(key.kind);
        let changed = if unread {
            set.ids.insert(key.id.clone())
        } else {
            set.ids.remove(&key.id)
        };
        if !changed {
            return false;
        }

        let gauge = UNREAD_CONVERSATIONS.with_label_values(&[key.kind.as_str()]);
        if unread {
            set.count += 1;
            gauge.inc();
            tracing::debug!(conversation = %key, "Marked unread");
        } else {
            set.count = set.count.saturating_sub(1);
            gauge.dec();
            tracing::debug!(conversation = %key, "Marked read");
        }

        state.revision += 1;
        let revision = state.revision;
        state.changed_at.insert(key.clone(), revision);

        // Published under the lock so listeners observe changes in call order.
        self.bus.publish(UnreadEvent::Changed {
            snapshot: state.snapshot(),
        });
        true
    }

    /// Add a conversation to the unread set
    ///
    /// # Returns
    /// `true` if the conversation was not already unread
    pub fn mark_unread(&self, key: &ConversationKey) -> bool {
        let mut state = self.lock();
        self.apply_locked(&mut state, key, true)
    }

    /// Remove a conversation from the unread set
    ///
    /// # Returns
    /// `true` if the conversation was unread
    pub fn mark_read(&self, key: &ConversationKey) -> bool {
        let mut state = self.lock();
        self.apply_locked(&mut state, key, false)
    }

    /// Current change revision
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Set the unread state of a conversation from an external source
    ///
    /// Skipped when the conversation changed after `since`, so a result
    /// computed from an older read of the store never overrides a live mark.
    ///
    /// # Returns
    /// `true` if the state changed
    pub fn reconcile(&self, key: &ConversationKey, unread: bool, since: u64) -> bool {
        let mut state = self.lock();
        if state.changed_at.get(key).is_some_and(|&at| at > since) {
            tracing::trace!(conversation = %key, "Changed since the store was read; left as is");
            return false;
        }
        self.apply_locked(&mut state, key, unread)
    }

    pub fn is_unread(&self, key: &ConversationKey) -> bool {
        self.lock().set(key.kind).ids.contains(&key.id)
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        self.lock().snapshot()
    }

    /// Every conversation currently unread
    pub fn unread_keys(&self) -> HashSet<ConversationKey> {
        let state = self.lock();
        [ConversationKind::Club, ConversationKind::Dm]
            .into_iter()
            .flat_map(|kind| {
                state
                    .set(kind)
                    .ids
                    .iter()
                    .map(move |id| ConversationKey::new(kind, id.clone()))
            })
            .collect()
    }
}

impl Drop for UnreadEngine {
    fn drop(&mut self) {
        let state = self.lock();
        for kind in [ConversationKind::Club, ConversationKind::Dm] {
            UNREAD_CONVERSATIONS
                .with_label_values(&[kind.as_str()])
                .sub(state.set(kind).count as i64);
        }
    }
}
