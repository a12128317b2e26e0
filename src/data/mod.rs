//! Data layer module
//!
//! Handles all data persistence and change propagation:
//! - SQLite database operations
//! - Realtime change feed
//! - Storage traits consumed by the unread core

mod database;
mod feed;
mod models;
mod store;

pub use database::Database;
pub use feed::{
    ChangeEvent, ChangeFeed, ChangeKind, FeedError, FeedRecord, FeedSubscription, FeedTable,
    MembershipRecord, TableFilter,
};
pub use models::*;
pub use store::{MessageSource, ReadCursorStore};

#[cfg(test)]
mod database_test;
