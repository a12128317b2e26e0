//! Unread tracking core
//!
//! - `engine`: in-memory unread sets, counts and the typed event bus
//! - `active`: conversations currently in view
//! - `subscription`: realtime listeners feeding the engine
//! - `mutator`: optimistic, debounced read-cursor writes with rollback
//! - `notifier`: deduplicated user-visible toasts
//! - `session`: one user's wiring of the above

mod active;
mod engine;
mod mutator;
mod notifier;
mod session;
mod subscription;

pub use active::ActiveConversations;
pub use engine::{EventBus, ReadState, UnreadEngine, UnreadEvent, UnreadSnapshot};
pub use mutator::{MarkReadOutcome, ReadStatusMutator, ReadTicket, WritePolicy};
pub use notifier::{Toast, ToastNotifier, ToastVariant};
pub use session::{RefreshReport, SessionRegistry, StreamLease, UnreadSession};
pub use subscription::SubscriptionManager;
