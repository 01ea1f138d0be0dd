//! C2: per-session client and server identity captured from `initialize`.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `clientInfo`/`serverInfo` shape exchanged during `initialize`, per
/// the MCP wire protocol: `{name, version, ...}`. Kept as an open map so
/// unknown extension fields round-trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Caches `clientInfo`/`serverInfo` for the lifetime of a session so the
/// capture pipeline can annotate every subsequent record (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct SessionInfoCache {
    client_info: Arc<DashMap<String, PeerInfo>>,
    server_info: Arc<DashMap<String, PeerInfo>>,
}

impl SessionInfoCache {
    pub fn new() -> Self {
        Self { client_info: Arc::new(DashMap::new()), server_info: Arc::new(DashMap::new()) }
    }

    /// Set `clientInfo` for a session, but only if unset: the invariant
    /// "at most one client identity per session" (spec.md §3) means a
    /// second `initialize` with different identity must be treated as a
    /// new session by the caller rather than overwriting this entry.
    pub fn set_client_info_if_absent(&self, session_id: &str, info: PeerInfo) -> bool {
        match self.client_info.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(info);
                true
            }
        }
    }

    pub fn client_info(&self, session_id: &str) -> Option<PeerInfo> {
        self.client_info.get(session_id).map(|r| r.value().clone())
    }

    pub fn set_server_info(&self, session_id: &str, info: PeerInfo) {
        self.server_info.insert(session_id.to_string(), info);
    }

    pub fn server_info(&self, session_id: &str) -> Option<PeerInfo> {
        self.server_info.get(session_id).map(|r| r.value().clone())
    }

    /// Drop all cached identity for a session, mirroring
    /// `StdioSessionManager` eviction (isolated mode) or explicit storage clear.
    pub fn evict(&self, session_id: &str) {
        self.client_info.remove(session_id);
        self.server_info.remove(session_id);
    }

    /// Clear all cached state, used on gateway shutdown.
    pub fn clear(&self) {
        self.client_info.clear();
        self.server_info.clear();
    }
}

impl Default for SessionInfoCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(name: &str) -> PeerInfo {
        PeerInfo { name: name.to_string(), version: "1.0".to_string(), extra: Default::default() }
    }

    #[test]
    fn client_info_set_once_per_session() {
        let cache = SessionInfoCache::new();
        assert!(cache.set_client_info_if_absent("s1", peer("agent-a")));
        assert!(!cache.set_client_info_if_absent("s1", peer("agent-b")));
        assert_eq!(cache.client_info("s1").unwrap().name, "agent-a");
    }

    #[test]
    fn server_info_overwrites_freely() {
        let cache = SessionInfoCache::new();
        cache.set_server_info("s1", peer("server-a"));
        cache.set_server_info("s1", peer("server-b"));
        assert_eq!(cache.server_info("s1").unwrap().name, "server-b");
    }

    #[test]
    fn evict_drops_both_maps() {
        let cache = SessionInfoCache::new();
        cache.set_client_info_if_absent("s1", peer("a"));
        cache.set_server_info("s1", peer("b"));
        cache.evict("s1");
        assert!(cache.client_info("s1").is_none());
        assert!(cache.server_info("s1").is_none());
    }
}
