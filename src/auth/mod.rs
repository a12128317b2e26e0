//! Caller identity
//!
//! Authentication itself happens upstream; handlers only need to know
//! which user a request acts for.

mod middleware;

pub use middleware::{CurrentUser, USER_HEADER};
