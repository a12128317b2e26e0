//! Per-user unread session
//!
//! Wires the engine, active registry, subscription manager, mutator and
//! notifier together for one `current_user_id`, and reconciles the
//! in-memory state against the store on demand.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use super::active::ActiveConversations;
use super::engine::{EventBus, UnreadEngine, UnreadEvent, UnreadSnapshot};
use super::mutator::{MarkReadOutcome, ReadStatusMutator, ReadTicket, WritePolicy};
use super::notifier::ToastNotifier;
use super::subscription::SubscriptionManager;
use crate::config::AppConfig;
use crate::data::{ConversationKey, ConversationKind, Database, ReadCursorStore};
use crate::error::AppError;

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Conversations found unread in the store but missing locally
    pub added: usize,
    /// Conversations unread locally but already read in the store
    pub removed: usize,
}

pub struct UnreadSession {
    user_id: String,
    db: Arc<Database>,
    engine: Arc<UnreadEngine>,
    active: Arc<ActiveConversations>,
    notifier: Arc<ToastNotifier>,
    subscriptions: SubscriptionManager,
    mutator: ReadStatusMutator,
    closed: AtomicBool,
    /// Open event streams; the session closes when the last one ends
    streams: std::sync::Mutex<usize>,
    last_used: std::sync::Mutex<Instant>,
}

impl UnreadSession {
    /// Open a session for `user_id`
    ///
    /// Listeners are attached before the store is read, so a message
    /// committed while seeding is either in the seed or seen live.
    ///
    /// # Errors
    /// Returns error if the membership or unread query fails
    pub async fn open(
        db: Arc<Database>,
        user_id: &str,
        config: &AppConfig,
    ) -> Result<Self, AppError> {
        let bus = EventBus::new(config.realtime.channel_capacity);
        let engine = Arc::new(UnreadEngine::new(bus.clone()));
        let active = Arc::new(ActiveConversations::new());
        let notifier = Arc::new(ToastNotifier::new(
            bus,
            config.notifier.dedupe_window(),
            Some(config.notifier.max_tracked_keys),
        ));
        let subscriptions = SubscriptionManager::new(
            user_id,
            db.feed().clone(),
            engine.clone(),
            active.clone(),
            config.realtime.resubscribe_delay(),
        );
        let store: Arc<dyn ReadCursorStore> = db.clone();
        let mutator = ReadStatusMutator::new(
            user_id,
            engine.clone(),
            active.clone(),
            notifier.clone(),
            store,
            WritePolicy::from(&config.read_status),
        );

        subscriptions.watch_membership();
        let membership = db.membership(user_id).await?;
        subscriptions.sync_membership(membership);

        for key in db.unread_conversations(user_id).await? {
            engine.mark_unread(&key);
        }

        let snapshot = engine.snapshot();
        tracing::info!(
            user_id,
            clubs = snapshot.club_count,
            conversations = snapshot.dm_count,
            "Unread session opened"
        );

        Ok(Self {
            user_id: user_id.to_string(),
            db,
            engine,
            active,
            notifier,
            subscriptions,
            mutator,
            closed: AtomicBool::new(false),
            streams: std::sync::Mutex::new(0),
            last_used: std::sync::Mutex::new(Instant::now()),
        })
    }

    fn lock_streams(&self) -> MutexGuard<'_, usize> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the session was last handed to a request
    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn stream_count(&self) -> usize {
        *self.lock_streams()
    }

    /// Register an open event stream. Returns `false` if the session closed.
    fn attach_stream(&self) -> bool {
        let mut streams = self.lock_streams();
        if self.is_closed() {
            return false;
        }
        *streams += 1;
        true
    }

    fn detach_stream(&self) {
        let mut streams = self.lock_streams();
        *streams = streams.saturating_sub(1);
        if *streams == 0 {
            // Closed under the lock so a concurrent attach sees it
            tracing::debug!(user_id = %self.user_id, "Last event stream ended");
            self.close();
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn snapshot(&self) -> UnreadSnapshot {
        self.engine.snapshot()
    }

    /// Listen for engine changes, read-state transitions and toasts
    pub fn subscribe(&self) -> broadcast::Receiver<UnreadEvent> {
        self.engine.subscribe()
    }

    pub async fn mark_conversation_read(
        &self,
        kind: ConversationKind,
        id: &str,
        delay: Option<Duration>,
    ) -> MarkReadOutcome {
        self.mutator.mark_conversation_read(kind, id, delay).await
    }

    /// Mark read without waiting for the write to settle
    pub fn request_read(&self, key: ConversationKey, delay: Option<Duration>) -> ReadTicket {
        self.mutator.request_read(key, delay)
    }

    /// Suppress unread marking while the conversation is in view
    pub fn set_active(&self, kind: ConversationKind, id: &str) -> bool {
        self.active.activate(&ConversationKey::new(kind, id))
    }

    pub fn clear_active(&self, kind: ConversationKind, id: &str) -> bool {
        self.active.deactivate(&ConversationKey::new(kind, id))
    }

    /// Reconcile the engine against the store
    ///
    /// Conversations with a write in flight are left alone; the mutator
    /// owns them until it settles. Conversations that changed while the
    /// store was being read keep their live state.
    pub async fn refresh(&self) -> Result<RefreshReport, AppError> {
        if self.is_closed() {
            return Ok(RefreshReport::default());
        }

        let membership = self.db.membership(&self.user_id).await?;
        self.subscriptions.sync_membership(membership);

        let since = self.engine.revision();
        let in_flight = self.mutator.pending_keys();
        let stored = self.db.unread_conversations(&self.user_id).await?;
        let current = self.engine.unread_keys();
        let mut report = RefreshReport::default();
        let owned_by_mutator =
            |key: &ConversationKey| in_flight.contains(key) || self.mutator.has_pending(key);

        for key in stored.difference(&current) {
            if owned_by_mutator(key) || self.active.suppress_if_active(key) {
                continue;
            }
            if self.engine.reconcile(key, true, since) {
                report.added += 1;
            }
        }

        for key in current.difference(&stored) {
            if owned_by_mutator(key) {
                continue;
            }
            if self.engine.reconcile(key, false, since) {
                report.removed += 1;
            }
        }

        if report != RefreshReport::default() {
            tracing::info!(
                user_id = %self.user_id,
                added = report.added,
                removed = report.removed,
                "Unread state reconciled"
            );
        }

        self.notifier.prune_old().await;
        Ok(report)
    }

    /// Cancel pending writes and release realtime listeners
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.mutator.close();
        self.subscriptions.teardown();
        self.active.clear();

        tracing::info!(user_id = %self.user_id, "Unread session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Keeps a session's event stream registered until dropped
pub struct StreamLease {
    session: Arc<UnreadSession>,
}

impl StreamLease {
    pub fn session(&self) -> &Arc<UnreadSession> {
        &self.session
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.session.detach_stream();
    }
}

/// Lazily opened sessions, one per user
pub struct SessionRegistry {
    db: Arc<Database>,
    config: AppConfig,
    sessions: Mutex<HashMap<String, Arc<UnreadSession>>>,
}

impl SessionRegistry {
    pub fn new(db: Arc<Database>, config: AppConfig) -> Self {
        Self {
            db,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the user's session, opening and seeding it on first use
    ///
    /// A session closed by its last stream ending is replaced.
    pub async fn get_or_open(&self, user_id: &str) -> Result<Arc<UnreadSession>, AppError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(user_id).filter(|session| !session.is_closed()) {
            session.touch();
            return Ok(session.clone());
        }

        let session = Arc::new(UnreadSession::open(self.db.clone(), user_id, &self.config).await?);
        sessions.insert(user_id.to_string(), session.clone());
        Ok(session)
    }

    /// Open an event stream on the user's session
    ///
    /// The session stays open while any lease is alive and closes when the
    /// last one drops.
    pub async fn open_stream(&self, user_id: &str) -> Result<StreamLease, AppError> {
        for _ in 0..3 {
            let session = self.get_or_open(user_id).await?;
            if session.attach_stream() {
                return Ok(StreamLease { session });
            }
        }
        Err(AppError::Internal(anyhow::anyhow!(
            "unread session for {user_id} kept closing while attaching a stream"
        )))
    }

    pub async fn get(&self, user_id: &str) -> Option<Arc<UnreadSession>> {
        self.sessions
            .lock()
            .await
            .get(user_id)
            .filter(|session| !session.is_closed())
            .cloned()
    }

    /// Close sessions without an open stream that were not used for `idle`,
    /// and forget sessions already closed
    ///
    /// # Returns
    /// Number of sessions removed
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let evicted: Vec<_> = {
            let mut sessions = self.sessions.lock().await;
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| {
                    session.is_closed()
                        || (session.stream_count() == 0 && session.idle_for() >= idle)
                })
                .map(|(user_id, _)| user_id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|user_id| sessions.remove(&user_id))
                .collect()
        };

        for session in &evicted {
            session.close();
        }
        evicted.len()
    }

    /// Close and forget one user's session
    pub async fn close(&self, user_id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(user_id);
        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Reconcile every open session. Failures are logged per session.
    ///
    /// # Returns
    /// Number of sessions refreshed successfully
    pub async fn refresh_all(&self) -> usize {
        let sessions: Vec<_> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|session| !session.is_closed())
            .cloned()
            .collect();
        let mut refreshed = 0;

        for session in sessions {
            match session.refresh().await {
                Ok(_) => refreshed += 1,
                Err(error) => {
                    tracing::warn!(user_id = %session.user_id(), %error, "Unread refresh failed");
                }
            }
        }

        refreshed
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, session) in sessions {
            session.close();
        }
    }

    /// Number of open sessions
    pub async fn len(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|session| !session.is_closed())
            .count()
    }
}
