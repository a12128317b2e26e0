//! Read-Status Mutator
//!
//! Turns "the user looked at this conversation" into an immediate local
//! read mark plus a debounced upsert of the persisted read cursor.
//!
//! Each conversation moves through
//!
//! ```text
//!   Read ── request ──▶ PendingWrite ──┬── write ok ────▶ Confirmed
//!                         │   ▲        └── write failed ─▶ RolledBack (unread again)
//!                         └───┘ re-armed by a repeat request while debouncing
//! ```
//!
//! At most one operation per conversation exists at a time. A repeat
//! request while the timer is still running replaces the timer; a repeat
//! request while the write is in flight is skipped. The conversation is
//! held active from the request until the operation settles.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::active::ActiveConversations;
use super::engine::{ReadState, UnreadEngine, UnreadEvent};
use super::notifier::ToastNotifier;
use crate::config::ReadStatusConfig;
use crate::data::{ConversationKey, ConversationKind, ReadCursorStore};
use crate::error::AppError;
use crate::metrics::{READ_CURSOR_WRITES_TOTAL, READ_ROLLBACKS_TOTAL};

/// How cursor writes are scheduled and retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    /// Delay used when a request does not specify one
    pub debounce: Duration,
    /// Attempts before the read mark is rolled back
    pub max_attempts: u32,
    /// Backoff between attempts, multiplied by the attempt number
    pub retry_backoff: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            debounce: Duration::ZERO,
            max_attempts: 1,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl From<&ReadStatusConfig> for WritePolicy {
    fn from(config: &ReadStatusConfig) -> Self {
        Self {
            debounce: config.debounce(),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff(),
        }
    }
}

/// How a read request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkReadOutcome {
    /// The cursor was persisted
    Confirmed,
    /// The write failed and the conversation is unread again
    RolledBack,
    /// Nothing to persist: the conversation was already read
    AlreadyRead,
    /// Another request for the same conversation owns the write
    Skipped,
    /// The session closed before the write settled
    Cancelled,
}

/// Handle on the settlement of a read request
#[derive(Debug)]
pub enum ReadTicket {
    Ready(MarkReadOutcome),
    Pending(oneshot::Receiver<MarkReadOutcome>),
}

impl ReadTicket {
    /// Wait until the debounced write settles
    pub async fn settled(self) -> MarkReadOutcome {
        match self {
            ReadTicket::Ready(outcome) => outcome,
            ReadTicket::Pending(receiver) => receiver.await.unwrap_or(MarkReadOutcome::Cancelled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Debouncing,
    Writing,
}

#[derive(Debug)]
struct PendingOperation {
    phase: Phase,
    /// Bumped whenever the timer is replaced; stale timers exit on mismatch
    generation: u64,
    /// Whether the optimistic step removed the conversation from the unread set
    removed: bool,
    task: Option<JoinHandle<()>>,
    waiter: Option<oneshot::Sender<MarkReadOutcome>>,
}

struct MutatorInner {
    user_id: String,
    engine: Arc<UnreadEngine>,
    active: Arc<ActiveConversations>,
    notifier: Arc<ToastNotifier>,
    store: Arc<dyn ReadCursorStore>,
    policy: WritePolicy,
    pending: Mutex<HashMap<ConversationKey, PendingOperation>>,
    closed: AtomicBool,
}

/// Clears the pending marker and resolves the waiter however the write ends
struct PendingGuard<'a> {
    inner: &'a MutatorInner,
    key: ConversationKey,
    outcome: MarkReadOutcome,
}

impl PendingGuard<'_> {
    fn settle(&mut self, outcome: MarkReadOutcome) {
        self.outcome = outcome;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // None when close() already drained and released the operation
        let Some(operation) = self.inner.lock_pending().remove(&self.key) else {
            return;
        };
        if self.inner.active.release(&self.key) {
            tracing::debug!(conversation = %self.key, "Messages arrived during the write");
            self.inner.engine.mark_unread(&self.key);
        }
        if let Some(waiter) = operation.waiter {
            let _ = waiter.send(self.outcome);
        }
    }
}

impl MutatorInner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<ConversationKey, PendingOperation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_write(
        self: &Arc<Self>,
        key: ConversationKey,
        generation: u64,
        delay: Duration,
    ) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_write(key, generation, delay).await })
    }

    async fn run_write(self: Arc<Self>, key: ConversationKey, generation: u64, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let removed = {
            let mut pending = self.lock_pending();
            match pending.get_mut(&key) {
                Some(op) if op.generation == generation && op.phase == Phase::Debouncing => {
                    op.phase = Phase::Writing;
                    // Traffic held back so far is older than the cursor about to be stamped
                    self.active.take_suppressed(&key);
                    op.removed
                }
                // Replaced by a newer timer or cancelled by close()
                _ => return,
            }
        };

        let mut guard = PendingGuard {
            inner: &self,
            key: key.clone(),
            outcome: MarkReadOutcome::Cancelled,
        };

        match self.write_cursor(&key).await {
            Ok(()) => {
                self.confirm(&key);
                guard.settle(MarkReadOutcome::Confirmed);
            }
            Err(error) => {
                self.roll_back(&key, removed, &error).await;
                guard.settle(MarkReadOutcome::RolledBack);
            }
        }
    }

    async fn write_cursor(&self, key: &ConversationKey) -> Result<(), AppError> {
        let kind = key.kind.as_str();
        let mut attempt = 1;

        loop {
            // Stamped at write time so late writes still carry the newest cursor.
            match self
                .store
                .upsert_read_cursor(&self.user_id, key, Utc::now())
                .await
            {
                Ok(()) => {
                    READ_CURSOR_WRITES_TOTAL
                        .with_label_values(&[kind, "success"])
                        .inc();
                    return Ok(());
                }
                Err(error) if attempt < self.policy.max_attempts => {
                    READ_CURSOR_WRITES_TOTAL
                        .with_label_values(&[kind, "retry"])
                        .inc();
                    tracing::warn!(
                        conversation = %key,
                        attempt,
                        %error,
                        "Read cursor write failed; retrying"
                    );
                    tokio::time::sleep(self.policy.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(error) => {
                    READ_CURSOR_WRITES_TOTAL
                        .with_label_values(&[kind, "failure"])
                        .inc();
                    return Err(error);
                }
            }
        }
    }

    fn confirm(&self, key: &ConversationKey) {
        tracing::debug!(conversation = %key, user_id = %self.user_id, "Messages marked as read");

        let bus = self.engine.bus();
        bus.publish(UnreadEvent::MessagesMarkedRead {
            conversation_id: key.id.clone(),
            kind: key.kind,
        });
        bus.publish(UnreadEvent::ReadStateUpdated {
            conversation: key.clone(),
            state: ReadState::Confirmed,
        });
    }

    async fn roll_back(&self, key: &ConversationKey, removed: bool, error: &AppError) {
        tracing::error!(
            conversation = %key,
            user_id = %self.user_id,
            %error,
            "Failed to persist read cursor; rolling back"
        );

        if removed || !self.active.is_viewing(key) {
            self.engine.mark_unread(key);
        } else {
            // Still in view: keep the next read mark writing the cursor
            self.active.suppress_if_active(key);
        }
        READ_ROLLBACKS_TOTAL
            .with_label_values(&[key.kind.as_str()])
            .inc();

        self.engine.bus().publish(UnreadEvent::ReadStateUpdated {
            conversation: key.clone(),
            state: ReadState::RolledBack,
        });
        self.notifier.mark_read_failed(key).await;
    }
}

/// Optimistic, debounced read marking for one user
#[derive(Clone)]
pub struct ReadStatusMutator {
    inner: Arc<MutatorInner>,
}

impl ReadStatusMutator {
    pub fn new(
        user_id: impl Into<String>,
        engine: Arc<UnreadEngine>,
        active: Arc<ActiveConversations>,
        notifier: Arc<ToastNotifier>,
        store: Arc<dyn ReadCursorStore>,
        policy: WritePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(MutatorInner {
                user_id: user_id.into(),
                engine,
                active,
                notifier,
                store,
                policy,
                pending: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Mark a conversation read and wait for the cursor write to settle
    ///
    /// The unread badge clears before this future first suspends.
    pub async fn mark_conversation_read(
        &self,
        kind: ConversationKind,
        id: &str,
        delay: Option<Duration>,
    ) -> MarkReadOutcome {
        self.request_read(ConversationKey::new(kind, id), delay)
            .settled()
            .await
    }

    /// Apply the read mark locally and schedule the cursor write
    ///
    /// # Arguments
    /// * `delay` - Debounce before the write; `None` uses the policy default
    pub fn request_read(&self, key: ConversationKey, delay: Option<Duration>) -> ReadTicket {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return ReadTicket::Ready(MarkReadOutcome::Cancelled);
        }
        let delay = delay.unwrap_or(inner.policy.debounce);

        let mut pending = inner.lock_pending();

        if let Some(op) = pending.get_mut(&key) {
            if op.phase == Phase::Debouncing {
                op.generation += 1;
                if let Some(task) = op.task.take() {
                    task.abort();
                }
                op.task = Some(inner.spawn_write(key.clone(), op.generation, delay));
                tracing::trace!(conversation = %key, "Read mark re-armed");
            } else {
                tracing::trace!(conversation = %key, "Read cursor write in flight; skipping");
            }
            return ReadTicket::Ready(MarkReadOutcome::Skipped);
        }

        // Suppress re-marking before the optimistic read so an echo of a
        // message arriving right now cannot flip the badge back.
        inner.active.hold(&key);

        let removed = inner.engine.mark_read(&key);
        let suppressed = inner.active.take_suppressed(&key);
        if !removed && !suppressed {
            if inner.active.release(&key) {
                inner.engine.mark_unread(&key);
            }
            return ReadTicket::Ready(MarkReadOutcome::AlreadyRead);
        }

        inner.engine.bus().publish(UnreadEvent::ReadStateUpdated {
            conversation: key.clone(),
            state: ReadState::PendingWrite,
        });

        let (waiter, receiver) = oneshot::channel();
        let task = inner.spawn_write(key.clone(), 0, delay);
        pending.insert(
            key,
            PendingOperation {
                phase: Phase::Debouncing,
                generation: 0,
                removed,
                task: Some(task),
                waiter: Some(waiter),
            },
        );

        ReadTicket::Pending(receiver)
    }

    pub fn has_pending(&self, key: &ConversationKey) -> bool {
        self.inner.lock_pending().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Conversations with a read mark not yet settled
    pub fn pending_keys(&self) -> HashSet<ConversationKey> {
        self.inner.lock_pending().keys().cloned().collect()
    }

    /// Cancel every pending timer and in-flight write
    ///
    /// Safe to call more than once. Later requests settle as `Cancelled`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);

        let drained: Vec<_> = self.inner.lock_pending().drain().collect();
        let cancelled = drained.len();
        for (key, op) in drained {
            self.inner.active.release(&key);
            if let Some(task) = op.task {
                task.abort();
            }
            if let Some(waiter) = op.waiter {
                let _ = waiter.send(MarkReadOutcome::Cancelled);
            }
        }

        if cancelled > 0 {
            tracing::debug!(cancelled, user_id = %self.inner.user_id, "Cancelled pending read marks");
        }
    }
}
