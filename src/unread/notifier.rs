//! Rate-limited toast notifier
//!
//! Deduplicates user-visible notifications per item: the first toast for a
//! key is delivered, repeats inside the dedupe window are dropped. Entries
//! expire after the window; the number of tracked keys is capped.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::engine::{EventBus, UnreadEvent};
use crate::data::{ConversationKey, ConversationKind};
use crate::metrics::TOASTS_TOTAL;

const DEFAULT_MAX_TRACKED_KEYS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastVariant {
    Default,
    Destructive,
}

/// `{title, description, variant}` payload rendered by the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub title: String,
    pub description: String,
    pub variant: ToastVariant,
}

impl Toast {
    /// Error toast for a read-cursor write that could not be persisted
    pub fn mark_read_failed(kind: ConversationKind) -> Self {
        let description = match kind {
            ConversationKind::Club => "Failed to mark club messages as read",
            ConversationKind::Dm => "Failed to mark conversation as read",
        };

        Self {
            title: "Error".to_string(),
            description: description.to_string(),
            variant: ToastVariant::Destructive,
        }
    }
}

/// Sends toasts onto the session bus, at most one per key per window
#[derive(Debug)]
pub struct ToastNotifier {
    /// Dedupe key -> time the last delivered toast was shown
    shown: Mutex<HashMap<String, Instant>>,
    window: Duration,
    max_tracked_keys: usize,
    bus: EventBus,
}

impl ToastNotifier {
    /// Create a notifier
    ///
    /// # Arguments
    /// * `window` - Repeats of the same key inside this window are dropped
    /// * `max_tracked_keys` - In-memory key cap (default: 1000)
    pub fn new(bus: EventBus, window: Duration, max_tracked_keys: Option<usize>) -> Self {
        Self {
            shown: Mutex::new(HashMap::new()),
            window,
            max_tracked_keys: max_tracked_keys.unwrap_or(DEFAULT_MAX_TRACKED_KEYS).max(1),
            bus,
        }
    }

    fn prune_expired_locked(shown: &mut HashMap<String, Instant>, window: Duration) -> usize {
        let before = shown.len();
        shown.retain(|_, at| at.elapsed() < window);
        before - shown.len()
    }

    fn evict_oldest_locked(shown: &mut HashMap<String, Instant>) -> bool {
        let Some(oldest_key) = shown
            .iter()
            .min_by_key(|(_, at)| **at)
            .map(|(key, _)| key.clone())
        else {
            return false;
        };
        shown.remove(&oldest_key);
        true
    }

    /// Deliver `toast` unless one with the same key was shown inside the window
    ///
    /// # Returns
    /// `true` if the toast was delivered
    pub async fn notify(&self, key: &str, toast: Toast) -> bool {
        let mut shown = self.shown.lock().await;

        if let Some(at) = shown.get(key) {
            if at.elapsed() < self.window {
                TOASTS_TOTAL.with_label_values(&["suppressed"]).inc();
                tracing::debug!(key, "Suppressed duplicate toast");
                return false;
            }
        }

        if !shown.contains_key(key) && shown.len() >= self.max_tracked_keys {
            Self::prune_expired_locked(&mut shown, self.window);
            if shown.len() >= self.max_tracked_keys {
                let _ = Self::evict_oldest_locked(&mut shown);
            }
        }

        shown.insert(key.to_string(), Instant::now());
        drop(shown);

        TOASTS_TOTAL.with_label_values(&["shown"]).inc();
        self.bus.publish(UnreadEvent::Toast { toast });
        true
    }

    /// Report a failed read mark for `conversation`
    pub async fn mark_read_failed(&self, conversation: &ConversationKey) -> bool {
        self.notify(
            &format!("mark-read:{conversation}"),
            Toast::mark_read_failed(conversation.kind),
        )
        .await
    }

    /// Prune expired entries
    pub async fn prune_old(&self) {
        let mut shown = self.shown.lock().await;
        let removed = Self::prune_expired_locked(&mut shown, self.window);

        if removed > 0 {
            tracing::debug!("Pruned {} expired toast entries", removed);
        }
    }

    pub async fn tracked_keys(&self) -> usize {
        self.shown.lock().await.len()
    }
}
