//! Chat history helpers
//!
//! - `pagination`: backward paging over a conversation's messages
//! - `format`: display names, time labels, sender grouping, previews

pub mod format;
mod pagination;

pub use pagination::{DEFAULT_PAGE_SIZE, MessagePager};
