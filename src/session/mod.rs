//! Per-session in-memory state: outstanding request correlation and
//! client/server identity captured from the `initialize` handshake.

pub mod info_cache;
pub mod request_tracker;

pub use info_cache::SessionInfoCache;
pub use request_tracker::RequestTracker;

/// Sentinel session id used when an inbound request carries no
/// `Mcp-Session-Id` header (spec.md §4.10 step 3).
pub const STATELESS_SESSION_ID: &str = "stateless";
