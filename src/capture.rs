//! C7: builds capture records from proxied exchanges and fans them to
//! storage (spec.md §4.7). Every public operation is fire-and-forget from
//! the proxy's perspective: failures are logged here and never surfaced to
//! the client (spec.md §7 propagation policy).

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;
use turbomcp_protocol::MessageId;

use crate::session::info_cache::PeerInfo;
use crate::session::{RequestTracker, SessionInfoCache};
use crate::storage::record::{ErrorRecord, RequestRecord, ResponseRecord, SseEventRecord};
use crate::storage::{CaptureRecord, StorageManager};

pub struct CapturePipeline {
    tracker: Arc<RequestTracker>,
    info_cache: Arc<SessionInfoCache>,
    storage: Arc<StorageManager>,
}

impl CapturePipeline {
    pub fn new(tracker: Arc<RequestTracker>, info_cache: Arc<SessionInfoCache>, storage: Arc<StorageManager>) -> Self {
        Self { tracker, info_cache, storage }
    }

    /// Build and persist a request record, register the start time with
    /// [`RequestTracker`], and capture `clientInfo` on `initialize`.
    pub async fn on_request(&self, server_name: &str, session_id: &str, request: &Value) {
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
        let id = request.get("id").and_then(value_to_message_id);

        if method == "initialize" {
            if let Some(client_info) = request
                .get("params")
                .and_then(|p| p.get("clientInfo"))
                .and_then(|v| serde_json::from_value::<PeerInfo>(v.clone()).ok())
            {
                self.info_cache.set_client_info_if_absent(session_id, client_info);
            }
        }

        let record = RequestRecord {
            timestamp: chrono::Utc::now(),
            server_name: server_name.to_string(),
            session_id: session_id.to_string(),
            method: method.clone(),
            id: id.clone(),
            request: request.clone(),
            client_info: self.info_cache.client_info(session_id),
            server_info: self.info_cache.server_info(session_id),
        };

        if let Err(e) = self.storage.write(CaptureRecord::Request(record)).await {
            warn!(server = server_name, session = session_id, error = %e, "failed to persist request record");
        }

        if let Some(id) = id {
            self.tracker.begin(session_id, id, &method);
        }
    }

    /// Whether `id` matches a request still outstanding for `session_id`.
    /// An SSE-delivered message with a matching id is a response, not a
    /// notification (spec.md §4.7: "if the event's `data` is a JSON-RPC
    /// response with known id, also counts as a response terminator").
    pub fn is_outstanding_response(&self, session_id: &str, id: &MessageId) -> bool {
        self.tracker.contains(session_id, id)
    }

    /// Build and persist a response record, end [`RequestTracker`] for
    /// duration, and capture `serverInfo` on `initialize`'s response via the
    /// one permitted backfill mutation (spec.md §4.7). `method` is the
    /// originating request's method when the caller already has it (the
    /// plain JSON dispatch path); when `None` (an SSE-delivered response),
    /// it is recovered from the matched [`RequestTracker`] entry instead.
    pub async fn on_response(
        &self,
        server_name: &str,
        session_id: &str,
        response: &Value,
        method: Option<&str>,
        http_status: Option<u16>,
    ) {
        let id = response.get("id").and_then(value_to_message_id);
        let completion = match &id {
            Some(id) => self.tracker.end(session_id, id),
            None => None,
        };
        let duration_ms = completion.as_ref().map(|c| c.duration_ms).unwrap_or(0);
        let method = method.map(str::to_string).or_else(|| completion.map(|c| c.method)).unwrap_or_default();
        let method = method.as_str();

        if method == "initialize" {
            if let Some(server_info) = response
                .get("result")
                .and_then(|r| r.get("serverInfo"))
                .and_then(|v| serde_json::from_value::<PeerInfo>(v.clone()).ok())
            {
                self.info_cache.set_server_info(session_id, server_info.clone());
                if let Some(id) = &id {
                    if let Err(e) = self
                        .storage
                        .update_server_info_for_initialize_request(session_id, id, server_info)
                        .await
                    {
                        warn!(server = server_name, session = session_id, error = %e, "failed to backfill server info");
                    }
                }
            }
        }

        let record = ResponseRecord {
            timestamp: chrono::Utc::now(),
            server_name: server_name.to_string(),
            session_id: session_id.to_string(),
            method: method.to_string(),
            id,
            response: response.clone(),
            http_status,
            duration_ms,
            client_info: self.info_cache.client_info(session_id),
            server_info: self.info_cache.server_info(session_id),
        };

        if let Err(e) = self.storage.write(CaptureRecord::Response(record)).await {
            warn!(server = server_name, session = session_id, error = %e, "failed to persist response record");
        }
    }

    /// Persist one SSE-delivered JSON-RPC message. If `event`'s `id`
    /// matches an outstanding request, this also terminates that request's
    /// duration measurement (spec.md §4.10 step 7).
    pub async fn on_sse_event(&self, server_name: &str, session_id: &str, event: &Value, sse_event_id: Option<String>) {
        let method = event.get("method").and_then(Value::as_str).map(str::to_string);
        let id = event.get("id").and_then(value_to_message_id);
        let duration_ms = match &id {
            Some(id) => self.tracker.end(session_id, id).map(|c| c.duration_ms),
            None => None,
        };

        let record = SseEventRecord {
            timestamp: chrono::Utc::now(),
            server_name: server_name.to_string(),
            session_id: session_id.to_string(),
            method,
            id,
            event: event.clone(),
            sse_event_id,
            duration_ms,
        };

        if let Err(e) = self.storage.write(CaptureRecord::SseEvent(record)).await {
            warn!(server = server_name, session = session_id, error = %e, "failed to persist sse-event record");
        }
    }

    /// Adopt a fresh session id for a request that was persisted under
    /// `old_session_id` (typically the stateless sentinel). Rekeys the
    /// in-flight duration tracker and backfills the persisted request
    /// record's session id, keyed by `(serverName, id)` (spec.md §9 Open
    /// Question; see `DESIGN.md`).
    pub async fn adopt_session_id(
        &self,
        server_name: &str,
        old_session_id: &str,
        new_session_id: &str,
        id: &MessageId,
    ) {
        self.tracker.rekey(old_session_id, new_session_id, id);
        if let Err(e) = self
            .storage
            .rekey_session_id(server_name, id, old_session_id, new_session_id)
            .await
        {
            warn!(server = server_name, error = %e, "failed to rekey session id on request record");
        }
    }

    /// Synthesize and persist a response record reflecting an upstream
    /// transport or decode failure (spec.md §4.7, §7).
    pub async fn on_error(
        &self,
        server_name: &str,
        session_id: &str,
        request: &Value,
        error: &crate::error::GatewayError,
        http_status: Option<u16>,
    ) {
        let method = request.get("method").and_then(Value::as_str).map(str::to_string);
        let id = request.get("id").and_then(value_to_message_id);
        let duration_ms = match &id {
            Some(id) => self.tracker.end(session_id, id).map(|c| c.duration_ms).unwrap_or(0),
            None => 0,
        };

        let record = ErrorRecord {
            timestamp: chrono::Utc::now(),
            server_name: server_name.to_string(),
            session_id: session_id.to_string(),
            method,
            id,
            error: serde_json::to_value(error.to_jsonrpc_error()).unwrap_or(Value::Null),
            http_status,
            duration_ms,
        };

        if let Err(e) = self.storage.write(CaptureRecord::Error(record)).await {
            warn!(server = server_name, session = session_id, error = %e, "failed to persist error record");
        }
    }
}

pub(crate) fn value_to_message_id(value: &Value) -> Option<MessageId> {
    match value {
        Value::String(s) => Some(MessageId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(MessageId::Number),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryBackend;
    use crate::storage::{RecordQuery, StorageBackend};

    fn pipeline() -> CapturePipeline {
        let storage = Arc::new(StorageManager::new(vec![Arc::new(InMemoryBackend::new()) as Arc<dyn StorageBackend>]));
        CapturePipeline::new(Arc::new(RequestTracker::new()), Arc::new(SessionInfoCache::new()), storage)
    }

    #[tokio::test]
    async fn on_request_persists_record_and_begins_tracking() {
        let pipeline = pipeline();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        pipeline.on_request("demo", "s1", &request).await;

        let records = pipeline.storage.query_records(RecordQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(pipeline.tracker.len() == 1);
    }

    #[tokio::test]
    async fn on_request_initialize_captures_client_info_once() {
        let pipeline = pipeline();
        let req1 = serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"clientInfo": {"name": "agent-a", "version": "1.0"}}
        });
        pipeline.on_request("demo", "s1", &req1).await;
        assert_eq!(pipeline.info_cache.client_info("s1").unwrap().name, "agent-a");

        let req2 = serde_json::json!({
            "jsonrpc": "2.0", "id": 2, "method": "initialize",
            "params": {"clientInfo": {"name": "agent-b", "version": "1.0"}}
        });
        pipeline.on_request("demo", "s1", &req2).await;
        assert_eq!(pipeline.info_cache.client_info("s1").unwrap().name, "agent-a");
    }

    #[tokio::test]
    async fn on_response_computes_duration_and_ends_tracking() {
        let pipeline = pipeline();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        pipeline.on_request("demo", "s1", &request).await;

        let response = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        pipeline.on_response("demo", "s1", &response, Some("tools/list"), Some(200)).await;

        assert!(pipeline.tracker.is_empty());
        let records = pipeline.storage.query_records(RecordQuery::default()).await.unwrap();
        let CaptureRecord::Response(resp) = &records[0] else { panic!("expected response record") };
        assert!(resp.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn on_response_initialize_backfills_server_info_onto_request() {
        let pipeline = pipeline();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        pipeline.on_request("demo", "s1", &request).await;

        let response = serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {"serverInfo": {"name": "upstream", "version": "2.0"}}
        });
        pipeline.on_response("demo", "s1", &response, Some("initialize"), Some(200)).await;

        assert_eq!(pipeline.info_cache.server_info("s1").unwrap().name, "upstream");
        let records = pipeline.storage.query_records(RecordQuery::default()).await.unwrap();
        let request_record = records.iter().find_map(|r| match r {
            CaptureRecord::Request(req) => Some(req),
            _ => None,
        }).unwrap();
        assert_eq!(request_record.server_info.as_ref().unwrap().name, "upstream");
    }

    #[tokio::test]
    async fn on_response_without_explicit_method_recovers_it_from_the_tracker() {
        let pipeline = pipeline();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        pipeline.on_request("demo", "s1", &request).await;

        let response = serde_json::json!({
            "jsonrpc": "2.0", "id": 1,
            "result": {"serverInfo": {"name": "upstream", "version": "2.0"}}
        });
        assert!(pipeline.is_outstanding_response("s1", &MessageId::Number(1)));
        pipeline.on_response("demo", "s1", &response, None, Some(200)).await;

        // The backfill only fires for `initialize`, which is only known here
        // because on_response recovered it from the matched tracker entry.
        assert_eq!(pipeline.info_cache.server_info("s1").unwrap().name, "upstream");
        let records = pipeline.storage.query_records(RecordQuery::default()).await.unwrap();
        let CaptureRecord::Response(resp) = &records[0] else { panic!("expected response record") };
        assert_eq!(resp.method, "initialize");
    }

    #[tokio::test]
    async fn is_outstanding_response_distinguishes_responses_from_notifications() {
        let pipeline = pipeline();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"});
        pipeline.on_request("demo", "s1", &request).await;

        assert!(pipeline.is_outstanding_response("s1", &MessageId::Number(1)));
        // A progress notification has no id at all, so it is never mistaken
        // for a response regardless of tracker state.
        assert!(!pipeline.is_outstanding_response("s1", &MessageId::Number(2)));
    }

    #[tokio::test]
    async fn on_error_persists_error_record_with_jsonrpc_error_body() {
        let pipeline = pipeline();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        pipeline.on_request("demo", "s1", &request).await;

        let error = crate::error::GatewayError::upstream_transport("connection refused");
        pipeline.on_error("demo", "s1", &request, &error, None).await;

        let records = pipeline.storage.query_records(RecordQuery::default()).await.unwrap();
        let CaptureRecord::Error(err) = &records[0] else { panic!("expected error record") };
        assert_eq!(err.error.get("code").and_then(Value::as_i64), Some(-32603));
    }

    #[tokio::test]
    async fn adopt_session_id_rekeys_tracker_and_backfills_storage() {
        let pipeline = pipeline();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        pipeline.on_request("demo", "stateless", &request).await;
        assert!(pipeline.tracker.len() == 1);

        let id = MessageId::Number(1);
        pipeline.adopt_session_id("demo", "stateless", "s1", &id).await;

        assert!(pipeline.tracker.end("stateless", &id).is_none());
        assert!(pipeline.tracker.end("s1", &id).is_some());

        let records = pipeline.storage.query_records(RecordQuery::default()).await.unwrap();
        let CaptureRecord::Request(req) = &records[0] else { panic!("expected request record") };
        assert_eq!(req.session_id, "s1");
    }

    #[tokio::test]
    async fn on_sse_event_with_known_id_terminates_tracking() {
        let pipeline = pipeline();
        let request = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        pipeline.on_request("demo", "s1", &request).await;

        let event = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        pipeline.on_sse_event("demo", "s1", &event, Some("evt-1".to_string())).await;

        assert!(pipeline.tracker.is_empty());
        let records = pipeline.storage.query_records(RecordQuery::default()).await.unwrap();
        let CaptureRecord::SseEvent(sse) = &records[0] else { panic!("expected sse-event record") };
        assert!(sse.duration_ms.is_some());
    }
}
