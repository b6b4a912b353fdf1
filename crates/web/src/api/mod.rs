//! REST API endpoint modules.

pub mod auth;
pub mod conflicts;
pub mod history;
pub mod merges;
pub mod scenarios;
pub mod status;
pub mod sync;

/// Header carrying the caller's user id.
pub const USER_HEADER: &str = "x-user-id";

/// User id recorded when the header is absent.
pub const ANONYMOUS: &str = "anonymous";
