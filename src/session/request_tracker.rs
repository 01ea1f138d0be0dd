//! C1: in-memory correlation of outstanding request IDs to start timestamps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use turbomcp_protocol::MessageId;
use tracing::warn;

/// Default interval at which the background sweep task runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How long an untracked entry may live before `sweep` reclaims it.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct TrackedRequest {
    started_at: Instant,
    method: String,
}

/// Outcome of [`RequestTracker::end`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub duration_ms: u64,
    pub method: String,
}

/// Tracks outstanding `(sessionId, requestId)` pairs so a response can be
/// matched back to its duration and originating method (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct RequestTracker {
    inflight: Arc<DashMap<(String, MessageId), TrackedRequest>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self { inflight: Arc::new(DashMap::new()) }
    }

    /// Record the start of a request. Last writer wins on a duplicate id
    /// within a session; this is logged since it indicates a client bug.
    pub fn begin(&self, session_id: &str, request_id: MessageId, method: &str) {
        let key = (session_id.to_string(), request_id);
        if self
            .inflight
            .insert(
                key.clone(),
                TrackedRequest { started_at: Instant::now(), method: method.to_string() },
            )
            .is_some()
        {
            warn!(session_id, method, "duplicate in-flight request id; overwriting tracker entry");
        }
    }

    /// Whether `(sessionId, requestId)` is currently tracked as in-flight,
    /// without consuming the entry. Used to classify an incoming SSE
    /// message as a response (id matches a pending request) versus a
    /// notification (spec.md §4.7).
    pub fn contains(&self, session_id: &str, request_id: &MessageId) -> bool {
        self.inflight.contains_key(&(session_id.to_string(), request_id.clone()))
    }

    /// Complete a tracked request, returning its duration and method.
    /// Returns `None` for a late or orphan response that was never tracked
    /// (already completed, swept, or never begun).
    pub fn end(&self, session_id: &str, request_id: &MessageId) -> Option<Completion> {
        let key = (session_id.to_string(), request_id.clone());
        self.inflight.remove(&key).map(|(_, tracked)| Completion {
            duration_ms: tracked.started_at.elapsed().as_millis() as u64,
            method: tracked.method,
        })
    }

    /// Remove entries older than `max_age` to bound memory from orphaned
    /// requests that will never receive a response.
    pub fn sweep(&self, max_age: Duration) {
        self.inflight.retain(|_, v| v.started_at.elapsed() < max_age);
    }

    /// Move a tracked request from `old_session_id` to `new_session_id`,
    /// preserving its start time. Used when a session id is adopted from an
    /// upstream `initialize` response (spec.md §4.6/§9 Open Question).
    pub fn rekey(&self, old_session_id: &str, new_session_id: &str, request_id: &MessageId) {
        let old_key = (old_session_id.to_string(), request_id.clone());
        if let Some((_, tracked)) = self.inflight.remove(&old_key) {
            self.inflight.insert((new_session_id.to_string(), request_id.clone()), tracked);
        }
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Spawn the periodic sweep task (ground: teacher's `IdTranslator::spawn_eviction_task`).
    pub fn spawn_sweep_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                self.sweep(DEFAULT_MAX_AGE);
            }
        })
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}
