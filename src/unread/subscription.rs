//! Subscription Manager
//!
//! Keeps one realtime listener per message table, filtered to the
//! conversations the user belongs to, and turns inbound INSERTs into
//! unread marks. A separate listener watches the user's membership and
//! rebuilds the message listeners when the filter set changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::active::ActiveConversations;
use super::engine::UnreadEngine;
use crate::data::{
    ChangeEvent, ChangeFeed, ChangeKind, ConversationKind, FeedError, FeedRecord,
    FeedSubscription, Membership, Message, TableFilter,
};
use crate::metrics::{REALTIME_EVENTS_TOTAL, RESUBSCRIPTIONS_TOTAL};

const KINDS: [ConversationKind; 2] = [ConversationKind::Club, ConversationKind::Dm];

#[derive(Default)]
struct ListenerState {
    membership: Membership,
    listeners: HashMap<ConversationKind, JoinHandle<()>>,
    membership_listener: Option<JoinHandle<()>>,
    torn_down: bool,
}

struct ManagerInner {
    user_id: String,
    feed: ChangeFeed,
    engine: Arc<UnreadEngine>,
    active: Arc<ActiveConversations>,
    resubscribe_delay: Duration,
    state: Mutex<ListenerState>,
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_listener(self: &Arc<Self>, filter: TableFilter) -> JoinHandle<()> {
        // Subscribe before spawning so events published from here on are seen.
        let subscription = self.feed.subscribe(filter);
        tokio::spawn(Arc::clone(self).listen(subscription))
    }

    /// Replace the message listener for `kind` with one matching the current
    /// membership. No listener is kept for an empty filter set.
    fn rebuild_locked(self: &Arc<Self>, state: &mut ListenerState, kind: ConversationKind) {
        if let Some(listener) = state.listeners.remove(&kind) {
            listener.abort();
        }

        let ids = state.membership.ids(kind);
        if ids.is_empty() {
            tracing::debug!(user_id = %self.user_id, kind = kind.as_str(), "No conversations to watch");
            return;
        }

        tracing::debug!(
            user_id = %self.user_id,
            kind = kind.as_str(),
            conversations = ids.len(),
            "Subscribing to message changes"
        );
        let listener = self.spawn_listener(TableFilter::conversations(kind, ids.clone()));
        state.listeners.insert(kind, listener);
    }

    async fn listen(self: Arc<Self>, mut subscription: FeedSubscription) {
        loop {
            match subscription.next().await {
                Ok(event) => self.handle_change(&event),
                Err(FeedError::Lagged(missed)) => {
                    let table = subscription.filter().table().as_str();
                    tracing::warn!(
                        user_id = %self.user_id,
                        table,
                        missed,
                        "Realtime listener dropped; resubscribing"
                    );
                    RESUBSCRIPTIONS_TOTAL.inc();

                    tokio::time::sleep(self.resubscribe_delay).await;
                    subscription = self.feed.subscribe(subscription.filter().clone());
                }
                Err(FeedError::Closed) => {
                    tracing::debug!(user_id = %self.user_id, "Change feed closed; listener exiting");
                    return;
                }
            }
        }
    }

    fn handle_change(self: &Arc<Self>, event: &ChangeEvent) {
        REALTIME_EVENTS_TOTAL
            .with_label_values(&[event.table.as_str(), event.event.as_str()])
            .inc();

        match event.record() {
            Some(FeedRecord::Message(message)) => self.handle_message(event.event, message),
            Some(FeedRecord::Membership(record)) if record.user_id == self.user_id => {
                let mut state = self.lock();
                if state.torn_down {
                    return;
                }

                let kind = record.conversation.kind;
                let id = record.conversation.id.clone();
                let changed = match event.event {
                    ChangeKind::Delete => state.membership.ids_mut(kind).remove(&id),
                    ChangeKind::Insert | ChangeKind::Update => {
                        state.membership.ids_mut(kind).insert(id)
                    }
                };

                if changed {
                    tracing::info!(
                        user_id = %self.user_id,
                        conversation = %record.conversation,
                        event = event.event.as_str(),
                        "Membership changed; rebuilding subscriptions"
                    );
                    self.rebuild_locked(&mut state, kind);
                }
            }
            _ => {}
        }
    }

    fn handle_message(&self, change: ChangeKind, message: &Message) {
        match change {
            ChangeKind::Insert => {
                let inbound = match message.kind {
                    ConversationKind::Club => message.sender_id != self.user_id,
                    ConversationKind::Dm => {
                        message.receiver_id.as_deref() == Some(self.user_id.as_str())
                    }
                };
                if !inbound {
                    return;
                }

                let key = message.key();
                if self.active.suppress_if_active(&key) {
                    tracing::trace!(conversation = %key, "Message for active conversation");
                    return;
                }
                self.engine.mark_unread(&key);
            }
            ChangeKind::Delete => {
                tracing::trace!(
                    conversation = %message.key(),
                    message_id = %message.id,
                    "Message deleted; unread state unchanged"
                );
            }
            ChangeKind::Update => {}
        }
    }
}

/// Realtime listeners for one user
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    pub fn new(
        user_id: impl Into<String>,
        feed: ChangeFeed,
        engine: Arc<UnreadEngine>,
        active: Arc<ActiveConversations>,
        resubscribe_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                user_id: user_id.into(),
                feed,
                engine,
                active,
                resubscribe_delay,
                state: Mutex::new(ListenerState::default()),
            }),
        }
    }

    /// Start listening with a known membership
    pub fn open(&self, membership: Membership) {
        self.watch_membership();
        self.sync_membership(membership);
    }

    /// Start the membership listener. No-op if it is already running.
    ///
    /// Call this before reading the membership from the store so joins
    /// committed in between are not missed.
    pub fn watch_membership(&self) {
        let mut state = self.inner.lock();
        if state.torn_down || state.membership_listener.is_some() {
            return;
        }
        state.membership_listener = Some(self.inner.spawn_listener(TableFilter::MembershipOf {
            user_id: self.inner.user_id.clone(),
        }));
    }

    /// Replace the membership and rebuild listeners whose filter set changed
    pub fn sync_membership(&self, membership: Membership) {
        let mut state = self.inner.lock();
        if state.torn_down {
            return;
        }

        for kind in KINDS {
            let ids = membership.ids(kind);
            let stale = state.membership.ids(kind) != ids
                || (!ids.is_empty() && !state.listeners.contains_key(&kind));
            if stale {
                *state.membership.ids_mut(kind) = ids.clone();
                self.inner.rebuild_locked(&mut state, kind);
            }
        }
    }

    /// Apply one change event as if it arrived on a listener
    pub fn handle_change(&self, event: &ChangeEvent) {
        self.inner.handle_change(event);
    }

    pub fn membership(&self) -> Membership {
        self.inner.lock().membership.clone()
    }

    /// Number of live message listeners
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Release every listener. Safe to call more than once.
    pub fn teardown(&self) {
        let mut state = self.inner.lock();
        if state.torn_down {
            return;
        }
        state.torn_down = true;

        for (_, listener) in state.listeners.drain() {
            listener.abort();
        }
        if let Some(listener) = state.membership_listener.take() {
            listener.abort();
        }

        tracing::debug!(user_id = %self.inner.user_id, "Realtime subscriptions torn down");
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ConversationKey, Sender};
    use crate::unread::engine::EventBus;
    use chrono::Utc;
    use std::collections::HashSet;

    struct Fixture {
        feed: ChangeFeed,
        engine: Arc<UnreadEngine>,
        active: Arc<ActiveConversations>,
        manager: SubscriptionManager,
    }

    fn fixture(feed_capacity: usize) -> Fixture {
        let feed = ChangeFeed::new(feed_capacity);
        let engine = Arc::new(UnreadEngine::new(EventBus::new(64)));
        let active = Arc::new(ActiveConversations::new());
        let manager = SubscriptionManager::new(
            "alice",
            feed.clone(),
            engine.clone(),
            active.clone(),
            Duration::from_millis(1),
        );
        Fixture {
            feed,
            engine,
            active,
            manager,
        }
    }

    fn membership(clubs: &[&str], conversations: &[&str]) -> Membership {
        Membership {
            club_ids: clubs.iter().map(|id| id.to_string()).collect(),
            conversation_ids: conversations.iter().map(|id| id.to_string()).collect(),
        }
    }

    fn club_message(club_id: &str, sender_id: &str) -> Message {
        Message {
            id: format!("m-{club_id}-{sender_id}"),
            kind: ConversationKind::Club,
            text: "run at 7?".to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: None,
            conversation_id: club_id.to_string(),
            timestamp: Utc::now(),
            sender: Some(Sender {
                id: sender_id.to_string(),
                display_name: sender_id.to_string(),
            }),
        }
    }

    fn direct_message(conversation_id: &str, sender_id: &str, receiver_id: &str) -> Message {
        Message {
            id: format!("m-{conversation_id}-{sender_id}"),
            kind: ConversationKind::Dm,
            text: "nice pace".to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: Some(receiver_id.to_string()),
            conversation_id: conversation_id.to_string(),
            timestamp: Utc::now(),
            sender: None,
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .is_ok()
    }

    #[test]
    fn club_insert_from_other_member_marks_unread() {
        let f = fixture(16);

        f.manager
            .handle_change(&ChangeEvent::message_inserted(club_message("club-1", "bob")));

        assert!(f.engine.is_unread(&ConversationKey::club("club-1")));
    }

    #[test]
    fn own_messages_never_count() {
        let f = fixture(16);

        f.manager
            .handle_change(&ChangeEvent::message_inserted(club_message("club-1", "alice")));
        f.manager.handle_change(&ChangeEvent::message_inserted(direct_message(
            "c1", "alice", "bob",
        )));

        assert_eq!(f.engine.snapshot().total_count, 0);
    }

    #[test]
    fn direct_message_counts_only_for_receiver() {
        let f = fixture(16);

        f.manager.handle_change(&ChangeEvent::message_inserted(direct_message(
            "c1", "bob", "alice",
        )));
        f.manager.handle_change(&ChangeEvent::message_inserted(direct_message(
            "c2", "bob", "carol",
        )));

        let snapshot = f.engine.snapshot();
        assert_eq!(
            snapshot.unread_conversation_ids,
            ["c1".to_string()].into_iter().collect()
        );
        assert_eq!(snapshot.dm_count, 1);
    }

    #[test]
    fn active_conversation_is_not_marked_until_deactivated() {
        let f = fixture(16);
        let key = ConversationKey::club("club-1");
        f.active.activate(&key);

        f.manager
            .handle_change(&ChangeEvent::message_inserted(club_message("club-1", "bob")));
        assert_eq!(f.engine.snapshot().total_count, 0);

        f.active.deactivate(&key);
        assert_eq!(f.engine.snapshot().total_count, 0);

        f.manager
            .handle_change(&ChangeEvent::message_inserted(club_message("club-1", "bob")));
        assert!(f.engine.is_unread(&key));
        // The suppressed message is remembered for the next read mark
        assert!(f.active.take_suppressed(&key));
    }

    #[test]
    fn delete_leaves_unread_state_alone() {
        let f = fixture(16);
        let message = club_message("club-1", "bob");
        f.manager
            .handle_change(&ChangeEvent::message_inserted(message.clone()));

        f.manager
            .handle_change(&ChangeEvent::message_deleted(message.clone()));
        assert!(f.engine.is_unread(&ConversationKey::club("club-1")));

        f.manager
            .handle_change(&ChangeEvent::message_deleted(club_message("club-2", "bob")));
        assert!(!f.engine.is_unread(&ConversationKey::club("club-2")));
    }

    #[tokio::test]
    async fn listeners_only_see_member_conversations() {
        let f = fixture(16);
        f.manager.open(membership(&["club-1"], &["c1"]));
        assert_eq!(f.manager.listener_count(), 2);

        f.feed
            .publish(ChangeEvent::message_inserted(club_message("club-2", "bob")));
        f.feed
            .publish(ChangeEvent::message_inserted(club_message("club-1", "bob")));

        let engine = f.engine.clone();
        assert!(eventually(|| engine.is_unread(&ConversationKey::club("club-1"))).await);
        assert!(!f.engine.is_unread(&ConversationKey::club("club-2")));
    }

    #[tokio::test]
    async fn empty_filter_sets_open_no_listener() {
        let f = fixture(16);
        f.manager.open(membership(&[], &["c1"]));

        assert_eq!(f.manager.listener_count(), 1);
    }

    #[tokio::test]
    async fn joining_a_club_rebuilds_the_filter() {
        let f = fixture(16);
        f.manager.open(Membership::default());
        assert_eq!(f.manager.listener_count(), 0);

        let club = ConversationKey::club("club-9");
        f.feed.publish(ChangeEvent::membership(
            ChangeKind::Insert,
            "alice",
            club.clone(),
        ));

        let manager = &f.manager;
        assert!(eventually(|| manager.membership().contains(&club)).await);
        assert_eq!(f.manager.listener_count(), 1);

        f.feed
            .publish(ChangeEvent::message_inserted(club_message("club-9", "bob")));
        let engine = f.engine.clone();
        assert!(eventually(|| engine.is_unread(&club)).await);
    }

    #[tokio::test]
    async fn other_users_membership_is_ignored() {
        let f = fixture(16);
        f.manager.open(Membership::default());

        f.manager.handle_change(&ChangeEvent::membership(
            ChangeKind::Insert,
            "bob",
            ConversationKey::club("club-9"),
        ));

        assert_eq!(f.manager.membership(), Membership::default());
    }

    #[tokio::test]
    async fn lagged_listener_resubscribes_with_same_filter() {
        let f = fixture(2);
        f.manager.open(membership(&["club-1", "club-2"], &[]));

        // Overflow the listener before it first runs
        for _ in 0..5 {
            f.feed
                .publish(ChangeEvent::message_inserted(club_message("club-1", "bob")));
        }

        let feed = f.feed.clone();
        let engine = f.engine.clone();
        assert!(
            eventually(|| {
                feed.publish(ChangeEvent::message_inserted(club_message("club-2", "bob")));
                engine.is_unread(&ConversationKey::club("club-2"))
            })
            .await
        );
        // Messages lost in the gap are left to the periodic refresh
        assert!(!f.engine.is_unread(&ConversationKey::club("club-1")));
    }

    #[tokio::test]
    async fn sync_membership_only_rebuilds_changed_kinds() {
        let f = fixture(16);
        f.manager.open(membership(&["club-1"], &[]));

        f.manager.sync_membership(membership(&["club-1"], &["c1"]));

        let membership = f.manager.membership();
        assert_eq!(membership.club_ids, HashSet::from(["club-1".to_string()]));
        assert_eq!(membership.conversation_ids, HashSet::from(["c1".to_string()]));
        assert_eq!(f.manager.listener_count(), 2);
    }

    #[tokio::test]
    async fn teardown_is_idempotent_and_stops_listening() {
        let f = fixture(16);
        f.manager.open(membership(&["club-1"], &[]));

        f.manager.teardown();
        f.manager.teardown();
        assert_eq!(f.manager.listener_count(), 0);

        f.feed
            .publish(ChangeEvent::message_inserted(club_message("club-1", "bob")));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!f.engine.is_unread(&ConversationKey::club("club-1")));

        // Reopening a torn-down manager is a no-op
        f.manager.open(membership(&["club-1"], &[]));
        assert_eq!(f.manager.listener_count(), 0);
    }
}
