//! Active-conversation registry
//!
//! A conversation is active while the UI has it open. Inbound messages for
//! an active conversation are not marked unread; instead the conversation
//! is remembered as having suppressed traffic, so the next read mark still
//! advances the persisted cursor past those messages.
//!
//! Two sources make a conversation active: the UI viewing it
//! ([`ActiveConversations::activate`]) and an in-flight read mark holding it
//! ([`ActiveConversations::hold`]). The hold ends when the read mark settles.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::data::ConversationKey;

#[derive(Debug, Default)]
struct Registry {
    viewing: HashSet<ConversationKey>,
    held: HashSet<ConversationKey>,
    suppressed: HashSet<ConversationKey>,
}

impl Registry {
    fn is_active(&self, key: &ConversationKey) -> bool {
        self.viewing.contains(key) || self.held.contains(key)
    }
}

#[derive(Debug, Default)]
pub struct ActiveConversations {
    inner: Mutex<Registry>,
}

impl ActiveConversations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a conversation as open. Returns `false` if it already was.
    pub fn activate(&self, key: &ConversationKey) -> bool {
        let activated = self.lock().viewing.insert(key.clone());
        if activated {
            tracing::debug!(conversation = %key, "Conversation active");
        }
        activated
    }

    /// Mark a conversation as closed. Returns `false` if it was not open.
    pub fn deactivate(&self, key: &ConversationKey) -> bool {
        let deactivated = self.lock().viewing.remove(key);
        if deactivated {
            tracing::debug!(conversation = %key, "Conversation inactive");
        }
        deactivated
    }

    /// Whether the UI has the conversation open
    pub fn is_viewing(&self, key: &ConversationKey) -> bool {
        self.lock().viewing.contains(key)
    }

    pub fn is_active(&self, key: &ConversationKey) -> bool {
        self.lock().is_active(key)
    }

    /// Keep the conversation active for the duration of a read mark
    pub fn hold(&self, key: &ConversationKey) {
        self.lock().held.insert(key.clone());
    }

    /// End a read-mark hold
    ///
    /// # Returns
    /// `true` if traffic was suppressed while held and the UI is not viewing
    /// the conversation; the caller must mark it unread again. The
    /// suppressed flag is consumed in that case.
    pub fn release(&self, key: &ConversationKey) -> bool {
        let mut registry = self.lock();
        if !registry.held.remove(key) || registry.viewing.contains(key) {
            return false;
        }
        registry.suppressed.remove(key)
    }

    /// If the conversation is active, record suppressed traffic for it.
    ///
    /// # Returns
    /// `true` if the caller must not mark the conversation unread
    pub fn suppress_if_active(&self, key: &ConversationKey) -> bool {
        let mut registry = self.lock();
        if !registry.is_active(key) {
            return false;
        }
        registry.suppressed.insert(key.clone());
        true
    }

    /// Consume the suppressed-traffic flag for a conversation
    pub fn take_suppressed(&self, key: &ConversationKey) -> bool {
        self.lock().suppressed.remove(key)
    }

    /// Forget every active conversation and suppressed flag
    pub fn clear(&self) {
        let mut registry = self.lock();
        registry.viewing.clear();
        registry.held.clear();
        registry.suppressed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_only_applies_while_active() {
        let active = ActiveConversations::new();
        let key = ConversationKey::dm("c1");

        assert!(!active.suppress_if_active(&key));
        assert!(!active.take_suppressed(&key));

        assert!(active.activate(&key));
        assert!(!active.activate(&key));
        assert!(active.suppress_if_active(&key));

        assert!(active.deactivate(&key));
        assert!(!active.suppress_if_active(&key));
    }

    #[test]
    fn suppressed_flag_survives_deactivation_until_taken() {
        let active = ActiveConversations::new();
        let key = ConversationKey::club("club-1");

        active.activate(&key);
        active.suppress_if_active(&key);
        active.deactivate(&key);

        assert!(active.take_suppressed(&key));
        assert!(!active.take_suppressed(&key));
    }

    #[test]
    fn hold_suppresses_until_released() {
        let active = ActiveConversations::new();
        let key = ConversationKey::dm("c1");

        active.hold(&key);
        assert!(active.is_active(&key));
        assert!(!active.is_viewing(&key));
        assert!(active.suppress_if_active(&key));

        // Traffic suppressed during the hold must surface again
        assert!(active.release(&key));
        assert!(!active.is_active(&key));
        assert!(!active.take_suppressed(&key));
        assert!(!active.release(&key));
    }

    #[test]
    fn release_keeps_the_view_of_the_ui() {
        let active = ActiveConversations::new();
        let key = ConversationKey::club("club-1");

        active.activate(&key);
        active.hold(&key);
        active.suppress_if_active(&key);

        assert!(!active.release(&key));
        assert!(active.is_active(&key));
        assert!(active.take_suppressed(&key));
    }
}
